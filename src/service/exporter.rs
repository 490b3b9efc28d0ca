use crate::error::{InventoryError, Result};
use crate::models::{InventoryItem, MasterInventory};
use crate::service::parser::Schema;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfLayerReference};
use rust_xlsxwriter::{Format, Workbook};
use std::fmt::Write;
use std::str::FromStr;

const SHEET_NAME: &str = "Inventario";
const SOURCE_COLUMN: &str = "origen";

// A4 portrait, millimetres
const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;
const TOP: f32 = 280.0;
const BOTTOM: f32 = 20.0;
const ROW_H: f32 = 6.0;
const COL_X: [f32; 5] = [15.0, 65.0, 95.0, 120.0, 165.0];

/// Renders master snapshots into downloadable artifacts.
/// Pure reads: the snapshot is borrowed and never locked.
#[derive(Debug, Clone)]
pub struct Exporter {
    headers: [String; 6],
    company: String,
    date_format: String,
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new(&Schema::default())
    }
}

impl Exporter {
    /// Spreadsheet headers use the schema's canonical names so exports can be
    /// uploaded again as they are
    pub fn new(schema: &Schema) -> Self {
        let [key, quantity, unit, category, timestamp] = schema.column_names();
        Self {
            headers: [key, quantity, unit, category, timestamp, SOURCE_COLUMN].map(str::to_string),
            company: "Inventario".to_string(),
            date_format: "%Y-%m-%d".to_string(),
        }
    }

    /// Heading printed on documents
    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = company.into();
        self
    }

    /// chrono format string for dates shown in documents
    pub fn with_date_format(mut self, date_format: impl Into<String>) -> Self {
        self.date_format = date_format.into();
        self
    }

    pub fn company(&self) -> &str {
        &self.company
    }

    pub fn date_format(&self) -> &str {
        &self.date_format
    }

    /// XLSX workbook with one sheet, one row per item in key order
    pub fn render_spreadsheet(&self, master: &MasterInventory) -> Result<Vec<u8>> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        let sheet = workbook.add_worksheet();
        sheet.set_name(SHEET_NAME).map_err(InventoryError::render)?;

        for (col, header) in self.headers.iter().enumerate() {
            sheet
                .write_string_with_format(0, col as u16, header.as_str(), &bold)
                .map_err(InventoryError::render)?;
        }

        for (idx, item) in master.items().enumerate() {
            let row = idx as u32 + 1;
            sheet.write_string(row, 0, item.key.as_str()).map_err(InventoryError::render)?;
            let quantity = item.quantity.to_string();
            let written = match exact_number(&item.quantity) {
                Some(number) => sheet.write_number(row, 1, number),
                None => sheet.write_string(row, 1, quantity.as_str()),
            };
            written.map_err(InventoryError::render)?;
            sheet.write_string(row, 2, item.unit.as_str()).map_err(InventoryError::render)?;
            sheet.write_string(row, 3, item.category.as_str()).map_err(InventoryError::render)?;
            sheet
                .write_string(row, 4, item.last_updated.to_rfc3339().as_str())
                .map_err(InventoryError::render)?;
            sheet.write_string(row, 5, item.source.as_str()).map_err(InventoryError::render)?;
        }

        let bytes = workbook.save_to_buffer().map_err(InventoryError::render)?;
        tracing::debug!("Rendered spreadsheet: {} items, {} bytes", master.len(), bytes.len());
        Ok(bytes)
    }

    /// Paginated PDF listing of the snapshot
    pub fn render_document(&self, master: &MasterInventory) -> Result<Vec<u8>> {
        let (doc, page, layer) =
            PdfDocument::new(SHEET_NAME, Mm(PAGE_W), Mm(PAGE_H), "Capa 1");
        let font = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(InventoryError::render)?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(InventoryError::render)?;

        let mut layer = doc.get_page(page).get_layer(layer);
        let mut y = TOP;

        layer.use_text(self.company.as_str(), 16.0, Mm(COL_X[0]), Mm(y), &bold);
        y -= 8.0;
        let generated = match master.updated_at() {
            Some(ts) => self.format_date(ts)?,
            None => "-".to_string(),
        };
        layer.use_text(
            format!(
                "Inventario maestro - corte #{} - {} - {} registros",
                master.generation(),
                generated,
                master.len()
            ),
            10.0,
            Mm(COL_X[0]),
            Mm(y),
            &font,
        );
        y -= 12.0;
        self.table_header(&layer, y, &bold);
        y -= ROW_H;

        if master.is_empty() {
            layer.use_text("Sin registros", 10.0, Mm(COL_X[0]), Mm(y), &font);
        }

        for item in master.items() {
            if y < BOTTOM {
                let (next_page, next_layer) = doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Capa 1");
                layer = doc.get_page(next_page).get_layer(next_layer);
                y = TOP;
                self.table_header(&layer, y, &bold);
                y -= ROW_H;
            }
            self.table_row(&layer, y, &font, item)?;
            y -= ROW_H;
        }

        let bytes = doc.save_to_bytes().map_err(InventoryError::render)?;
        tracing::debug!("Rendered document: {} items, {} bytes", master.len(), bytes.len());
        Ok(bytes)
    }

    fn table_header(&self, layer: &PdfLayerReference, y: f32, font: &IndirectFontRef) {
        let titles = ["Codigo", "Cantidad", "Unidad", "Categoria", "Actualizado"];
        for (x, title) in COL_X.iter().zip(titles) {
            layer.use_text(title, 10.0, Mm(*x), Mm(y), font);
        }
    }

    fn table_row(
        &self,
        layer: &PdfLayerReference,
        y: f32,
        font: &IndirectFontRef,
        item: &InventoryItem,
    ) -> Result<()> {
        let cells = [
            clip(&item.key, 26),
            clip(&item.quantity.to_string(), 14),
            clip(&item.unit, 12),
            clip(&item.category, 24),
            self.format_date(item.last_updated)?,
        ];
        for (x, text) in COL_X.iter().zip(cells) {
            layer.use_text(text, 9.0, Mm(*x), Mm(y), font);
        }
        Ok(())
    }

    fn format_date(&self, ts: DateTime<Utc>) -> Result<String> {
        let mut out = String::new();
        write!(out, "{}", ts.format(&self.date_format))
            .map_err(|_| InventoryError::Render(format!("invalid date format {:?}", self.date_format)))?;
        Ok(out)
    }
}

/// `f64` that reads back as exactly `quantity`, if there is one
fn exact_number(quantity: &BigDecimal) -> Option<f64> {
    let number: f64 = quantity.to_string().parse().ok()?;
    if !number.is_finite() {
        return None;
    }
    let back = BigDecimal::from_str(&number.to_string()).ok()?;
    (back == *quantity).then_some(number)
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut clipped: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        clipped.push('~');
        clipped
    }
}
