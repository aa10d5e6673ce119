//! Rounding spreadsheet import
//!
//! The export format is positional:
//!
//! ```text
//! row 1-3  on-call block      date, provider, hospitals
//! row 4    column headers     matched by keyword
//! row 5+   patient rows       interleaved with hospital section headers
//! ```
//!
//! Parsing is a pure function of the text; nothing is written until the whole
//! input has been decoded. [`apply_import`] then writes the decoded records
//! one at a time.

use async_trait::async_trait;
use logger_redacted::hash_identifier;
use serde::{Deserialize, Serialize};

use crate::error::{RoundingError, RoundingResult};
use crate::model::{OnCallShift, PatientVisit, ProcedureStatus};
use crate::store::RemoteStore;

/// Fewest rows that can hold the on-call block, the header and one patient.
pub const MIN_ROWS: usize = 5;

const ON_CALL_ROWS: usize = 3;
const HEADER_ROW: usize = 3;

/// Split CSV text into rows of cells.
///
/// Quoted cells may contain commas, doubled quotes and line breaks. Blank
/// lines are kept as rows with one empty cell because row position carries
/// meaning in this format. A final line break does not start a new row.
///
/// # Errors
///
/// `MalformedImport` when a quoted cell is never closed.
pub fn tokenize(text: &str) -> RoundingResult<Vec<Vec<String>>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut quote_line = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    cell.push(c);
                }
                _ => cell.push(c),
            }
            continue;
        }

        match c {
            '"' if cell.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            ',' => row.push(std::mem::take(&mut cell)),
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                line += 1;
                row.push(std::mem::take(&mut cell));
                rows.push(std::mem::take(&mut row));
            }
            _ => cell.push(c),
        }
    }

    if in_quotes {
        return Err(RoundingError::MalformedImport(format!(
            "Unterminated quoted cell starting on line {}",
            quote_line
        )));
    }
    if !cell.is_empty() || !row.is_empty() {
        row.push(cell);
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Room,
    Date,
    Name,
    Dob,
    Mrn,
    Findings,
    Plan,
    SupervisingMd,
    Pending,
    FollowUp,
}

// Checked in order; the first entry with a matching keyword decides the column.
const HEADER_KEYWORDS: &[(&[&str], Column)] = &[
    (&["hospital", "room"], Column::Room),
    (&["date"], Column::Date),
    (&["name"], Column::Name),
    (&["dob", "birth"], Column::Dob),
    (&["mrn"], Column::Mrn),
    (&["dx", "finding"], Column::Findings),
    (&["plan"], Column::Plan),
    (&["supervising", "md"], Column::SupervisingMd),
    (&["pending"], Column::Pending),
    (&["follow"], Column::FollowUp),
];

/// Column index per recognised header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnMap {
    pub room: Option<usize>,
    pub date: Option<usize>,
    pub name: Option<usize>,
    pub dob: Option<usize>,
    pub mrn: Option<usize>,
    pub findings: Option<usize>,
    pub plan: Option<usize>,
    pub supervising_md: Option<usize>,
    pub pending: Option<usize>,
    pub follow_up: Option<usize>,
}

impl ColumnMap {
    /// Match each header cell against the keyword table. A later column
    /// mapping to the same field replaces an earlier one.
    pub fn from_headers(headers: &[String]) -> Self {
        let mut map = Self::default();
        for (index, header) in headers.iter().enumerate() {
            let normalized = header.trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            let column = HEADER_KEYWORDS
                .iter()
                .find(|(keywords, _)| keywords.iter().any(|k| normalized.contains(k)))
                .map(|(_, column)| *column);
            if let Some(column) = column {
                *map.slot(column) = Some(index);
            }
        }
        map
    }

    fn slot(&mut self, column: Column) -> &mut Option<usize> {
        match column {
            Column::Room => &mut self.room,
            Column::Date => &mut self.date,
            Column::Name => &mut self.name,
            Column::Dob => &mut self.dob,
            Column::Mrn => &mut self.mrn,
            Column::Findings => &mut self.findings,
            Column::Plan => &mut self.plan,
            Column::SupervisingMd => &mut self.supervising_md,
            Column::Pending => &mut self.pending,
            Column::FollowUp => &mut self.follow_up,
        }
    }
}

fn cell(row: &[String], index: Option<usize>) -> String {
    index
        .and_then(|i| row.get(i))
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Decoded spreadsheet contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBatch {
    pub shifts: Vec<OnCallShift>,
    pub patients: Vec<PatientVisit>,
}

/// Decode a rounding spreadsheet export.
///
/// # Errors
///
/// `MalformedImport` when the input has fewer than [`MIN_ROWS`] rows or a
/// quoted cell is unterminated.
pub fn parse_rounding_csv(text: &str) -> RoundingResult<ImportBatch> {
    let rows = tokenize(text)?;
    if rows.len() < MIN_ROWS {
        return Err(RoundingError::MalformedImport(format!(
            "Expected on-call rows, a header row and patient rows; got {} rows",
            rows.len()
        )));
    }

    let mut batch = ImportBatch::default();

    for row in rows.iter().take(ON_CALL_ROWS) {
        if let [date, provider, hospitals, ..] = row.as_slice() {
            batch.shifts.push(OnCallShift::new(date.trim(), provider.trim(), hospitals.trim()));
        }
    }

    let columns = rows
        .get(HEADER_ROW)
        .map(|headers| ColumnMap::from_headers(headers))
        .unwrap_or_default();
    if columns.mrn.is_none() {
        tracing::warn!("Import header has no MRN column; every patient row will be skipped");
    }

    let mut current_hospital = String::new();
    let mut skipped = 0usize;
    for (index, row) in rows.iter().enumerate().skip(HEADER_ROW + 1) {
        let Some((first, rest)) = row.split_first() else {
            continue;
        };
        if !is_blank(first) && rest.iter().all(|c| is_blank(c)) {
            current_hospital = first.trim().to_string();
            continue;
        }
        if is_blank(first) && rest.iter().all(|c| is_blank(c)) {
            continue;
        }

        let mrn = cell(row, columns.mrn);
        if mrn.is_empty() {
            tracing::warn!(row = index + 1, cells = row.len(), "Skipping row without MRN");
            skipped += 1;
            continue;
        }

        batch.patients.push(PatientVisit {
            room: cell(row, columns.room),
            name: cell(row, columns.name),
            dob: cell(row, columns.dob),
            hospital: current_hospital.clone(),
            findings_text: cell(row, columns.findings),
            plan: cell(row, columns.plan),
            supervising_md: cell(row, columns.supervising_md),
            pending: cell(row, columns.pending),
            follow_up: cell(row, columns.follow_up),
            priority: false,
            procedure_status: ProcedureStatus::ToDo,
            archived: false,
            ..PatientVisit::new(mrn, cell(row, columns.date))
        });
    }

    tracing::info!(
        shifts = batch.shifts.len(),
        patients = batch.patients.len(),
        skipped_without_mrn = skipped,
        "Parsed rounding import"
    );
    Ok(batch)
}

/// Outcome of writing an [`ImportBatch`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub shifts_parsed: usize,
    pub shifts_saved: usize,
    /// Shifts missing a date or provider, or not written for lack of rights
    pub shifts_skipped: usize,
    pub patients_parsed: usize,
    pub patients_created: usize,
    /// Visit keys that already existed
    pub duplicates: Vec<String>,
}

/// Where decoded records are written.
#[async_trait]
pub trait ImportTarget: Send {
    async fn upsert_shift(&mut self, shift: &OnCallShift) -> RoundingResult<()>;

    /// # Errors
    ///
    /// `Conflict` when the visit key already exists.
    async fn create_patient(&mut self, visit: &PatientVisit) -> RoundingResult<()>;
}

/// Writes straight through a [`RemoteStore`].
pub struct RemoteImportTarget<'a> {
    store: &'a dyn RemoteStore,
}

impl<'a> RemoteImportTarget<'a> {
    pub fn new(store: &'a dyn RemoteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ImportTarget for RemoteImportTarget<'_> {
    async fn upsert_shift(&mut self, shift: &OnCallShift) -> RoundingResult<()> {
        self.store.save_on_call_shift(shift).await?;
        Ok(())
    }

    async fn create_patient(&mut self, visit: &PatientVisit) -> RoundingResult<()> {
        self.store.save_patient(visit).await?;
        Ok(())
    }
}

/// Write `batch` sequentially: shifts with a date and provider first, then
/// every patient. Duplicate visits are recorded and skipped.
///
/// # Errors
///
/// The first failure other than `Conflict`; records written before it stay written.
pub async fn apply_import<T: ImportTarget + ?Sized>(
    target: &mut T,
    batch: &ImportBatch,
    save_shifts: bool,
) -> RoundingResult<ImportReport> {
    let mut report = ImportReport {
        shifts_parsed: batch.shifts.len(),
        patients_parsed: batch.patients.len(),
        ..ImportReport::default()
    };

    for shift in &batch.shifts {
        if !save_shifts || is_blank(&shift.date) || is_blank(&shift.provider) {
            report.shifts_skipped += 1;
            continue;
        }
        target.upsert_shift(shift).await?;
        report.shifts_saved += 1;
    }
    if !save_shifts && !batch.shifts.is_empty() {
        tracing::warn!(count = batch.shifts.len(), "On-call rows skipped: administrator role required");
    }

    for visit in &batch.patients {
        match target.create_patient(visit).await {
            Ok(()) => report.patients_created += 1,
            Err(RoundingError::Conflict(_)) => {
                tracing::info!(mrn_hash = %hash_identifier(&visit.mrn), date = %visit.date, "Skipping duplicate visit");
                report.duplicates.push(visit.visit_key().to_string());
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        shifts_saved = report.shifts_saved,
        patients_created = report.patients_created,
        duplicates = report.duplicates.len(),
        "Import applied"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
\n\
\n\
\n\
Hospital,Date,Name,DOB,MRN,Dx,Plan,MD,Pending,Follow\n\
General Hospital\n\
101,2024-01-01,Jane Doe,1990-01-01,MRN123,Cough,Observe,Dr. Lee,,\n";

    #[test]
    fn test_tokenize_quotes_and_blank_lines() {
        let rows = tokenize("a,\"b,c\",\"say \"\"hi\"\"\"\r\n\r\n\"multi\nline\",x").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["a", "b,c", "say \"hi\""]);
        assert_eq!(rows[1], vec![""]);
        assert_eq!(rows[2], vec!["multi\nline", "x"]);
    }

    #[test]
    fn test_tokenize_rejects_open_quote() {
        let err = tokenize("a,\"unterminated\nb").unwrap_err();
        assert!(matches!(err, RoundingError::MalformedImport(_)));
    }

    #[test]
    fn test_sample_sheet() {
        let batch = parse_rounding_csv(SAMPLE).unwrap();
        assert!(batch.shifts.is_empty());
        assert_eq!(batch.patients.len(), 1);

        let patient = &batch.patients[0];
        assert_eq!(patient.hospital, "General Hospital");
        assert_eq!(patient.mrn, "MRN123");
        assert_eq!(patient.room, "101");
        assert_eq!(patient.date, "2024-01-01");
        assert_eq!(patient.name, "Jane Doe");
        assert_eq!(patient.findings_text, "Cough");
        assert_eq!(patient.supervising_md, "Dr. Lee");
        assert_eq!(patient.procedure_status, ProcedureStatus::ToDo);
        assert!(!patient.priority);
        assert!(patient.is_unsaved());
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_row_without_mrn_is_logged_by_position_only() {
        let text = "\
\n\
\n\
\n\
Hospital,Date,Name,DOB,MRN,Dx,Plan,MD,Pending,Follow\n\
101,2024-01-01,Jane Doe,1990-01-01,,Cough,Observe,Dr. Lee,,\n";
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let batch = tracing::subscriber::with_default(subscriber, || parse_rounding_csv(text)).unwrap();
        assert!(batch.patients.is_empty());

        let output = String::from_utf8(log.0.lock().clone()).unwrap();
        assert!(output.contains("Skipping row without MRN"));
        assert!(output.contains("row=5"));
        for cell in ["Jane Doe", "Cough", "Observe", "Dr. Lee", "1990-01-01"] {
            assert!(!output.contains(cell), "log leaked {:?}: {}", cell, output);
        }
    }

    #[test]
    fn test_too_few_rows() {
        let err = parse_rounding_csv("a,b,c\n\n\nHospital,MRN\n").unwrap_err();
        assert!(matches!(err, RoundingError::MalformedImport(_)));
    }

    #[test]
    fn test_on_call_block_and_sections() {
        let text = "\
2024-01-01,Dr. A,General\n\
2024-01-02,Dr. B\n\
2024-01-03,,St. Mary\n\
Room,Date,Patient Name,DOB,MRN\n\
General\n\
1,2024-01-01,A,1980-01-01,M1\n\
2,2024-01-01,B,1980-01-01,\n\
,,,,\n\
St. Mary\n\
3,2024-01-01,C,1980-01-01,M3\n";

        let batch = parse_rounding_csv(text).unwrap();
        assert_eq!(batch.shifts.len(), 2);
        assert_eq!(batch.shifts[0].provider, "Dr. A");
        assert_eq!(batch.shifts[1].provider, "");

        let hospitals: Vec<_> = batch.patients.iter().map(|p| p.hospital.as_str()).collect();
        assert_eq!(hospitals, vec!["General", "St. Mary"]);
        assert_eq!(batch.patients[1].mrn, "M3");
    }

    #[test]
    fn test_header_keywords() {
        let headers: Vec<String> = ["Hospital/Room #", "Admit Date", "DOB", "Findings", "Supervising MD", "Follow-up", "Notes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = ColumnMap::from_headers(&headers);
        assert_eq!(map.room, Some(0));
        assert_eq!(map.date, Some(1));
        assert_eq!(map.dob, Some(2));
        assert_eq!(map.findings, Some(3));
        assert_eq!(map.supervising_md, Some(4));
        assert_eq!(map.follow_up, Some(5));
        assert_eq!(map.mrn, None);
    }

    #[derive(Default)]
    struct RecordingTarget {
        shifts: Vec<OnCallShift>,
        patients: Vec<PatientVisit>,
    }

    #[async_trait]
    impl ImportTarget for RecordingTarget {
        async fn upsert_shift(&mut self, shift: &OnCallShift) -> RoundingResult<()> {
            self.shifts.push(shift.clone());
            Ok(())
        }

        async fn create_patient(&mut self, visit: &PatientVisit) -> RoundingResult<()> {
            if self.patients.iter().any(|p| p.visit_key() == visit.visit_key()) {
                return Err(RoundingError::Conflict("Patient already rounded".into()));
            }
            self.patients.push(visit.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_apply_skips_incomplete_shifts_and_duplicates() {
        let batch = ImportBatch {
            shifts: vec![
                OnCallShift::new("2024-01-01", "Dr. A", ""),
                OnCallShift::new("2024-01-02", "", "General"),
            ],
            patients: vec![
                PatientVisit::new("MRN1", "2024-01-01"),
                PatientVisit::new("MRN1", "2024-01-01"),
                PatientVisit::new("MRN2", "2024-01-01"),
            ],
        };

        let mut target = RecordingTarget::default();
        let report = apply_import(&mut target, &batch, true).await.unwrap();

        assert_eq!(report.shifts_saved, 1);
        assert_eq!(report.shifts_skipped, 1);
        assert_eq!(report.patients_created, 2);
        assert_eq!(report.duplicates, vec!["MRN1|2024-01-01"]);
        assert_eq!(target.shifts.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_without_shift_rights() {
        let batch = ImportBatch {
            shifts: vec![OnCallShift::new("2024-01-01", "Dr. A", "")],
            patients: vec![PatientVisit::new("MRN1", "2024-01-01")],
        };
        let mut target = RecordingTarget::default();
        let report = apply_import(&mut target, &batch, false).await.unwrap();

        assert_eq!(report.shifts_saved, 0);
        assert_eq!(report.shifts_skipped, 1);
        assert!(target.shifts.is_empty());
        assert_eq!(report.patients_created, 1);
    }
}
