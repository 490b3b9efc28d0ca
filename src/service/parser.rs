use crate::error::{InventoryError, Result, RowError, RowErrorKind};
use crate::models::{InventoryItem, UploadedFile};
use bigdecimal::BigDecimal;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use indexmap::IndexMap;
use regex::Regex;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Longer quantity cells are rejected rather than materialised
const MAX_QUANTITY_CHARS: usize = 64;

static YEAR_FIRST: OnceLock<Option<Regex>> = OnceLock::new();
static DAY_FIRST: OnceLock<Option<Regex>> = OnceLock::new();

/// Accepted header names per column. The first alias is the canonical name
/// used when exporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub key: Vec<String>,
    pub quantity: Vec<String>,
    pub unit: Vec<String>,
    pub category: Vec<String>,
    /// Optional per-row provenance timestamp
    pub timestamp: Vec<String>,
}

fn aliases(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            key: aliases(&["codigo", "cod", "referencia", "item", "sku", "key", "item code"]),
            quantity: aliases(&["cantidad", "cant", "existencias", "stock", "quantity", "qty"]),
            unit: aliases(&["unidad", "unidad de medida", "um", "unit"]),
            category: aliases(&["categoria", "tipo", "grupo", "category"]),
            timestamp: aliases(&["fecha", "actualizado", "fecha actualizacion", "last updated", "timestamp"]),
        }
    }
}

impl Schema {
    /// Canonical header names: key, quantity, unit, category, timestamp
    pub fn column_names(&self) -> [&str; 5] {
        fn first<'a>(list: &'a [String], fallback: &'a str) -> &'a str {
            list.first().map(String::as_str).unwrap_or(fallback)
        }
        [
            first(&self.key, "codigo"),
            first(&self.quantity, "cantidad"),
            first(&self.unit, "unidad"),
            first(&self.category, "categoria"),
            first(&self.timestamp, "fecha"),
        ]
    }
}

/// Normalized candidates of one file plus the rows that were left out
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub items: Vec<InventoryItem>,
    pub rejected: Vec<RowError>,
}

/// Turns uploaded CSV/XLSX bytes into inventory candidates. Pure: no I/O.
#[derive(Debug, Clone, Default)]
pub struct Parser {
    schema: Schema,
    use_file_date: bool,
}

struct Columns {
    key: usize,
    quantity: usize,
    unit: usize,
    category: usize,
    timestamp: Option<usize>,
}

impl Parser {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            use_file_date: false,
        }
    }

    /// Use a date embedded in the file name as provenance for rows without
    /// their own timestamp
    pub fn with_file_date(mut self, enabled: bool) -> Self {
        self.use_file_date = enabled;
        self
    }

    pub fn uses_file_date(&self) -> bool {
        self.use_file_date
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn parse(&self, file: &UploadedFile) -> Result<ParsedFile> {
        let table = read_table(file)?;

        let Some(header_idx) = table.iter().position(|row| !is_blank(row)) else {
            return Err(InventoryError::schema(&file.name, "file has no header row"));
        };
        let columns = self.resolve_columns(&file.name, &table[header_idx])?;
        let fallback_ts = self.file_provenance(file);

        let mut parsed = ParsedFile::default();
        for (offset, row) in table[header_idx + 1..].iter().enumerate() {
            if is_blank(row) {
                continue;
            }
            // header is spreadsheet row header_idx + 1
            let row_number = header_idx + offset + 2;
            match parse_row(row, &columns, fallback_ts, &file.name) {
                Ok(item) => parsed.items.push(item),
                Err(kind) => parsed.rejected.push(RowError {
                    row: row_number,
                    kind,
                }),
            }
        }

        tracing::debug!(
            "Parsed {}: {} candidates, {} rejected",
            file.name,
            parsed.items.len(),
            parsed.rejected.len()
        );
        Ok(parsed)
    }

    fn resolve_columns(&self, file_name: &str, header: &[String]) -> Result<Columns> {
        let mut headers: IndexMap<String, usize> = IndexMap::new();
        for (idx, cell) in header.iter().enumerate() {
            let norm = normalize_header(cell);
            if !norm.is_empty() {
                headers.entry(norm).or_insert(idx);
            }
        }

        let [key_name, qty_name, unit_name, category_name, _] = self.schema.column_names();
        let mut missing = Vec::new();
        let mut require = |aliases: &[String], name: &str| {
            let found = find_column(&headers, aliases);
            if found.is_none() {
                missing.push(name.to_string());
            }
            found.unwrap_or_default()
        };
        let key = require(&self.schema.key, key_name);
        let quantity = require(&self.schema.quantity, qty_name);
        let unit = require(&self.schema.unit, unit_name);
        let category = require(&self.schema.category, category_name);

        if !missing.is_empty() {
            return Err(InventoryError::schema(
                file_name,
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }

        Ok(Columns {
            key,
            quantity,
            unit,
            category,
            timestamp: find_column(&headers, &self.schema.timestamp),
        })
    }

    fn file_provenance(&self, file: &UploadedFile) -> DateTime<Utc> {
        if self.use_file_date {
            if let Some(dt) = date_from_file_name(&file.name).and_then(|d| d.and_hms_opt(0, 0, 0)) {
                return Utc.from_utc_datetime(&dt);
            }
        }
        file.uploaded_at
    }
}

fn parse_row(
    row: &[String],
    columns: &Columns,
    fallback_ts: DateTime<Utc>,
    source: &str,
) -> std::result::Result<InventoryItem, RowErrorKind> {
    let cell = |idx: usize| row.get(idx).map(|s| s.trim()).unwrap_or("");

    let key = cell(columns.key);
    if key.is_empty() {
        return Err(RowErrorKind::EmptyKey);
    }

    let raw_qty = cell(columns.quantity);
    let quantity = parse_quantity(raw_qty).ok_or_else(|| RowErrorKind::NonNumericQuantity {
        value: raw_qty.to_string(),
    })?;
    if quantity < BigDecimal::from(0) {
        return Err(RowErrorKind::NegativeQuantity {
            value: raw_qty.to_string(),
        });
    }

    let last_updated = match columns.timestamp.map(cell).filter(|s| !s.is_empty()) {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| RowErrorKind::InvalidTimestamp {
            value: raw.to_string(),
        })?,
        None => fallback_ts,
    };

    Ok(InventoryItem {
        key: key.to_string(),
        quantity,
        unit: cell(columns.unit).to_string(),
        category: cell(columns.category).to_string(),
        last_updated,
        source: source.to_string(),
    })
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

fn find_column(headers: &IndexMap<String, usize>, aliases: &[String]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.get(&normalize_header(alias)).copied())
}

/// Lowercase, strip combining marks after NFD, collapse whitespace
pub(crate) fn normalize_header(raw: &str) -> String {
    let folded: String = raw
        .trim()
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accepts `12.5`, `12,5`, `1.234,5` and `1,234.5`. Exponents are refused.
pub(crate) fn parse_quantity(raw: &str) -> Option<BigDecimal> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty()
        || cleaned.len() > MAX_QUANTITY_CHARS
        || cleaned.contains(['e', 'E'])
    {
        return None;
    }
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };
    BigDecimal::from_str(&normalized).ok()
}

/// RFC 3339 or common day-first / ISO layouts; naive values are taken as UTC
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    const DATETIME_FORMATS: [&str; 5] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
        }
    }
    None
}

/// First `YYYY[-._]MMDD`-style date in the file stem; when that one is not a
/// real date, the first `DD-MM-YYYY`
pub(crate) fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let stem = Path::new(name).file_stem()?.to_str()?;
    captured_date(&YEAR_FIRST, r"([0-9]{4})[._-]?([0-9]{2})[._-]?([0-9]{2})", stem, [1, 2, 3])
        .or_else(|| {
            captured_date(&DAY_FIRST, r"([0-9]{2})[._-]([0-9]{2})[._-]([0-9]{4})", stem, [3, 2, 1])
        })
}

/// First match only; `[year, month, day]` are capture group indexes
fn captured_date(
    cell: &OnceLock<Option<Regex>>,
    pattern: &str,
    text: &str,
    [year, month, day]: [usize; 3],
) -> Option<NaiveDate> {
    let re = cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()?;
    let caps = re.captures(text)?;
    let group = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
    NaiveDate::from_ymd_opt(group(year)? as i32, group(month)?, group(day)?)
}

fn read_table(file: &UploadedFile) -> Result<Vec<Vec<String>>> {
    if file.bytes.starts_with(ZIP_MAGIC) {
        read_xlsx(file)
    } else {
        read_csv(file)
    }
}

fn read_csv(file: &UploadedFile) -> Result<Vec<Vec<String>>> {
    let text = std::str::from_utf8(&file.bytes)
        .map_err(|_| InventoryError::schema(&file.name, "file is neither XLSX nor UTF-8 CSV"))?;
    let text = text.trim_start_matches('\u{feff}');

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sniff_delimiter(text))
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| InventoryError::schema(&file.name, format!("invalid CSV: {}", e)))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    }
}

fn read_xlsx(file: &UploadedFile) -> Result<Vec<Vec<String>>> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(file.bytes.as_slice()))
        .map_err(|e| InventoryError::schema(&file.name, format!("invalid XLSX: {}", e)))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| InventoryError::schema(&file.name, "workbook has no worksheets"))?
        .map_err(|e| InventoryError::schema(&file.name, format!("invalid XLSX: {}", e)))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::DateTime(dt) => excel_serial_to_text(dt.as_f64()),
        other => other.to_string(),
    }
}

/// Excel serial day number (1900 system) as `YYYY-MM-DD HH:MM:SS`
fn excel_serial_to_text(serial: f64) -> String {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0));
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch
        .and_then(|e| e.checked_add_signed(chrono::Duration::milliseconds(millis)))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| serial.to_string())
}
