// 🏗️ Record Loader - spreadsheet rows → typed transaction records
// One spreadsheet per entity; rows start at a fixed data offset.

use crate::config::ColumnMapping;
use crate::error::{AnalysisError, AnalysisResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// Length of a PAN (Permanent Account Number)
pub const PAN_LENGTH: usize = 10;

/// Entity name lives in row 6, column C of the sheet header block
const ENTITY_NAME_ROW: usize = 5;
const ENTITY_NAME_COL: usize = 2;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Raw cell value as handed over by a spreadsheet reader
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    /// Text form of the cell, None when blank
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Bool(b) => Some(b.to_string()),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_text().is_none()
    }
}

/// Direction of a transaction relative to the entity owning the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Sale,
    Purchase,
}

impl Direction {
    /// Map an information code to a direction.
    ///
    /// `GSTR1-R` is outward supply reported by the entity (sale),
    /// `GSTR1-P` is supply reported by the counterparty to the entity (purchase).
    pub fn from_code(code: &str) -> Option<Direction> {
        match code.trim().to_uppercase().as_str() {
            "GSTR1-R" | "SALE" | "SALES" => Some(Direction::Sale),
            "GSTR1-P" | "PURCHASE" | "PURCHASES" => Some(Direction::Purchase),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sale => "SALE",
            Direction::Purchase => "PURCHASE",
        }
    }
}

/// One row of spreadsheet data, validated at load time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub direction: Direction,
    pub counterparty_id: String,
    pub amount: Decimal,

    // Optional descriptive fields
    pub counterparty_name: Option<String>,
    pub taxpayer_type: Option<String>,
    pub business_nature: Option<String>,
    pub turnover_range: Option<String>,
    pub income_range: Option<String>,

    /// 1-based row in the source sheet
    pub row_number: usize,
}

impl TransactionRecord {
    pub fn new(direction: Direction, counterparty_id: &str, amount: Decimal) -> Self {
        TransactionRecord {
            direction,
            counterparty_id: counterparty_id.to_string(),
            amount,
            counterparty_name: None,
            taxpayer_type: None,
            business_nature: None,
            turnover_range: None,
            income_range: None,
            row_number: 0,
        }
    }

    /// Builder pattern: add counterparty name
    pub fn with_name(mut self, name: &str) -> Self {
        self.counterparty_name = Some(name.to_string());
        self
    }

    /// Builder pattern: add taxpayer type
    pub fn with_taxpayer_type(mut self, taxpayer_type: &str) -> Self {
        self.taxpayer_type = Some(taxpayer_type.to_string());
        self
    }

    /// Builder pattern: add nature of business
    pub fn with_business_nature(mut self, nature: &str) -> Self {
        self.business_nature = Some(nature.to_string());
        self
    }
}

/// A row the loader refused, kept for diagnostics and for the parse cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub row: usize,
    pub reason: String,
}

/// Everything the loader extracts from one entity spreadsheet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSheet {
    pub entity_name: Option<String>,
    pub records: Vec<TransactionRecord>,
    pub rejected: Vec<RejectedRow>,
}

impl ParsedSheet {
    /// Rejected rows as recoverable errors
    pub fn errors(&self, file: &str) -> Vec<AnalysisError> {
        self.rejected
            .iter()
            .map(|r| AnalysisError::malformed(file, r.row, r.reason.clone()))
            .collect()
    }
}

/// Where the data rows are and which column holds what
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderSettings {
    /// 1-based header row; data start on the following row
    pub data_start_row: usize,
    pub columns: ColumnMapping,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        LoaderSettings {
            data_start_row: crate::config::DEFAULT_DATA_START_ROW,
            columns: ColumnMapping::default(),
        }
    }
}

// ============================================================================
// SPREADSHEET FORMATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    Excel,
    Csv,
}

impl SourceFormat {
    pub fn name(&self) -> &str {
        match self {
            SourceFormat::Excel => "Excel workbook",
            SourceFormat::Csv => "CSV export",
        }
    }
}

/// RowSource - reads every row of the first sheet of a file
///
/// Readers do no interpretation: cells come back exactly as stored.
pub trait RowSource: Send + Sync {
    fn read_rows(&self, path: &Path) -> AnalysisResult<Vec<Vec<Cell>>>;

    fn format(&self) -> SourceFormat;
}

/// Detect the reader for a file from its extension
pub fn detect_format(path: &Path) -> Option<SourceFormat> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Some(SourceFormat::Excel),
        "csv" => Some(SourceFormat::Csv),
        _ => None,
    }
}

/// Factory: reader for a format
pub fn get_source(format: SourceFormat) -> Box<dyn RowSource> {
    match format {
        SourceFormat::Excel => Box::new(ExcelSource),
        SourceFormat::Csv => Box::new(CsvSource),
    }
}

/// Excel reader (xlsx, xls, xlsb, ods) backed by calamine
pub struct ExcelSource;

impl RowSource for ExcelSource {
    fn read_rows(&self, path: &Path) -> AnalysisResult<Vec<Vec<Cell>>> {
        use calamine::{open_workbook_auto, Data, Reader};

        let file = path.display().to_string();
        let spreadsheet_err = |reason: String| AnalysisError::Spreadsheet {
            file: file.clone(),
            reason,
        };

        let mut workbook = open_workbook_auto(path).map_err(|e| spreadsheet_err(e.to_string()))?;
        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| spreadsheet_err("workbook contains no sheets".to_string()))?;
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| spreadsheet_err(format!("sheet '{}': {}", sheet_name, e)))?;

        // Ranges start at the first used cell; pad so indexes stay absolute
        let (start_row, start_col) = range.start().unwrap_or((0, 0));
        let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); start_row as usize];

        for row in range.rows() {
            let mut cells = vec![Cell::Empty; start_col as usize];
            cells.extend(row.iter().map(|data| match data {
                Data::Empty => Cell::Empty,
                Data::String(s) => Cell::Text(s.clone()),
                Data::Float(n) => Cell::Number(*n),
                Data::Int(n) => Cell::Number(*n as f64),
                Data::Bool(b) => Cell::Bool(*b),
                other => Cell::Text(other.to_string()),
            }));
            rows.push(cells);
        }

        Ok(rows)
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Excel
    }
}

/// CSV reader for sheets exported to CSV (same layout, no headers assumed)
pub struct CsvSource;

impl RowSource for CsvSource {
    fn read_rows(&self, path: &Path) -> AnalysisResult<Vec<Vec<Cell>>> {
        use csv::ReaderBuilder;

        let file = File::open(path)?;
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| AnalysisError::Spreadsheet {
                file: path.display().to_string(),
                reason: e.to_string(),
            })?;
            rows.push(
                record
                    .iter()
                    .map(|field| {
                        if field.trim().is_empty() {
                            Cell::Empty
                        } else {
                            Cell::Text(field.to_string())
                        }
                    })
                    .collect(),
            );
        }

        Ok(rows)
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Csv
    }
}

// ============================================================================
// ROW PARSING
// ============================================================================

/// Lazily turn raw rows into transaction records.
///
/// The header row at `data_start_row` is skipped and iteration stops at the
/// first row whose counterparty column is blank. Rows with an unknown
/// direction code are dropped with a warning; rows with an unparsable
/// required column come back as `MalformedRow`.
pub fn parse_rows<'a>(
    file: &'a str,
    rows: &'a [Vec<Cell>],
    settings: &'a LoaderSettings,
) -> impl Iterator<Item = AnalysisResult<TransactionRecord>> + 'a {
    let cols = &settings.columns;
    let first_data_idx = settings.data_start_row; // header at data_start_row - 1

    rows.iter()
        .enumerate()
        .skip(first_data_idx)
        .take_while(move |(_, row)| !cell_at(row, cols.pan).is_blank())
        .filter_map(move |(idx, row)| parse_row(file, idx + 1, row, cols).transpose())
}

fn cell_at(row: &[Cell], col: usize) -> &Cell {
    row.get(col).unwrap_or(&Cell::Empty)
}

fn text_at(row: &[Cell], col: usize) -> Option<String> {
    cell_at(row, col).as_text()
}

/// Ok(None) means "skip silently after logging" (unknown direction)
fn parse_row(
    file: &str,
    row_number: usize,
    row: &[Cell],
    cols: &ColumnMapping,
) -> AnalysisResult<Option<TransactionRecord>> {
    let code = text_at(row, cols.info_code)
        .ok_or_else(|| AnalysisError::malformed(file, row_number, "missing information code"))?;

    let direction = match Direction::from_code(&code) {
        Some(d) => d,
        None => {
            warn!(file, row = row_number, code = %code, "unknown information code, row skipped");
            return Ok(None);
        }
    };

    let pan = text_at(row, cols.pan)
        .map(|p| p.to_uppercase())
        .ok_or_else(|| AnalysisError::malformed(file, row_number, "missing counterparty PAN"))?;
    if !is_valid_pan(&pan) {
        return Err(AnalysisError::malformed(
            file,
            row_number,
            format!("counterparty id '{}' is not a {}-character PAN", pan, PAN_LENGTH),
        ));
    }

    let amount = parse_amount_cell(cell_at(row, cols.amount)).map_err(|reason| {
        AnalysisError::malformed(file, row_number, reason)
    })?;

    Ok(Some(TransactionRecord {
        direction,
        counterparty_id: pan,
        amount,
        counterparty_name: text_at(row, cols.party_name),
        taxpayer_type: text_at(row, cols.taxpayer_type),
        business_nature: text_at(row, cols.business_nature),
        turnover_range: text_at(row, cols.turnover_range),
        income_range: text_at(row, cols.income_range),
        row_number,
    }))
}

fn parse_amount_cell(cell: &Cell) -> Result<Decimal, String> {
    let amount = match cell {
        Cell::Empty => return Ok(Decimal::ZERO),
        Cell::Number(n) if n.is_finite() => {
            Decimal::from_str(&n.to_string()).map_err(|_| format!("amount {} is out of range", n))?
        }
        Cell::Number(n) => return Err(format!("amount {} is not finite", n)),
        Cell::Bool(_) => return Err("amount is a boolean".to_string()),
        Cell::Text(s) => parse_amount(s).ok_or_else(|| format!("amount '{}' is not a number", s))?,
    };

    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(format!("amount {} is negative", amount));
    }
    Ok(amount)
}

/// Tolerant numeric cleanup for amounts.
///
/// Strips currency symbols, spaces and thousands separators, and accepts
/// either `.` or `,` as the decimal marker. Blank text parses as zero.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("Rs.")
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '₹' | '$' | '€' | '£' | '\''))
        .collect();

    if cleaned.is_empty() {
        return Some(Decimal::ZERO);
    }

    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();

    let normalized = match (commas, dots) {
        (0, 0) | (0, 1) => cleaned,
        (0, _) => cleaned.replace('.', ""),
        (_, 0) => {
            // Single comma followed by anything but three digits is a decimal comma
            let after = cleaned.rsplit(',').next().unwrap_or("");
            if commas == 1 && after.len() != 3 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        _ => {
            // Both present: whichever comes last is the decimal marker
            let last_comma = cleaned.rfind(',');
            let last_dot = cleaned.rfind('.');
            if last_comma > last_dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
    };

    Decimal::from_str(&normalized).ok()
}

/// PANs are fixed-length alphanumeric identifiers
pub fn is_valid_pan(value: &str) -> bool {
    value.len() == PAN_LENGTH && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// PAN embedded in a spreadsheet filename (`<PAN>_anything.xlsx`)
pub fn pan_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let candidate = stem.split('_').next()?.trim().to_uppercase();
    if is_valid_pan(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Entity display name from the sheet header block
pub fn entity_name_from_rows(rows: &[Vec<Cell>]) -> Option<String> {
    rows.get(ENTITY_NAME_ROW)
        .and_then(|row| text_at(row, ENTITY_NAME_COL))
}

/// Read a spreadsheet and split it into records, rejects and entity name
pub fn load_file(path: &Path, settings: &LoaderSettings) -> AnalysisResult<ParsedSheet> {
    let format = detect_format(path).ok_or_else(|| AnalysisError::Spreadsheet {
        file: path.display().to_string(),
        reason: "unsupported file extension".to_string(),
    })?;

    let rows = get_source(format).read_rows(path)?;
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let sheet = parse_sheet(&file, &rows, settings);
    debug!(
        file = %file,
        format = format.name(),
        records = sheet.records.len(),
        rejected = sheet.rejected.len(),
        "loaded spreadsheet"
    );
    Ok(sheet)
}

/// Parse already-read rows (shared by the file loader and in-memory sources)
pub fn parse_sheet(file: &str, rows: &[Vec<Cell>], settings: &LoaderSettings) -> ParsedSheet {
    let mut sheet = ParsedSheet {
        entity_name: entity_name_from_rows(rows),
        ..Default::default()
    };

    for result in parse_rows(file, rows, settings) {
        match result {
            Ok(record) => sheet.records.push(record),
            Err(AnalysisError::MalformedRow { row, reason, .. }) => {
                warn!(file, row, reason = %reason, "malformed row skipped");
                sheet.rejected.push(RejectedRow { row, reason });
            }
            Err(other) => {
                warn!(file, error = %other, "row skipped");
            }
        }
    }

    sheet
}
