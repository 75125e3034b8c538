//! Measurement Writer: streaming CSV with the header pinned by the first record.

use std::fmt::{self, Display};
use std::io::{self, Write};

use crate::sampler::SampleRecord;

/// Error type for output failures.
#[derive(Debug)]
pub enum WriteError {
    /// CSV encoding failed, including a record whose length differs from the header.
    Csv(csv::Error),
    /// The underlying stream failed.
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Csv(e) => write!(f, "CSV error: {}", e),
            WriteError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Csv(e) => Some(e),
            WriteError::Io(e) => Some(e),
        }
    }
}

impl From<csv::Error> for WriteError {
    fn from(e: csv::Error) -> Self {
        WriteError::Csv(e)
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        WriteError::Io(e)
    }
}

/// Writes records positionally against a header fixed at the first commit.
///
/// Field names of later records are not compared with the header; callers
/// must add fields in the same order every time. A record with a different
/// number of fields is rejected.
pub struct MeasurementWriter<W: Write> {
    csv: csv::Writer<W>,
    header: Vec<String>,
    pending: Vec<(String, String)>,
    records: u64,
}

impl<W: Write> MeasurementWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            csv: csv::Writer::from_writer(output),
            header: Vec::new(),
            pending: Vec::new(),
            records: 0,
        }
    }

    /// Starts a new record, discarding any fields not yet committed.
    pub fn begin_record(&mut self) {
        self.pending.clear();
    }

    /// Appends a field to the current record.
    pub fn add_field(&mut self, label: &str, value: impl Display) {
        self.pending.push((label.to_string(), value.to_string()));
    }

    /// Writes the current record, preceded by the header on the first commit.
    ///
    /// Committing an empty record is a no-op.
    pub fn commit(&mut self) -> Result<(), WriteError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let fields = std::mem::take(&mut self.pending);

        if self.header.is_empty() {
            let header: Vec<String> = fields.iter().map(|(label, _)| label.clone()).collect();
            self.csv.write_record(&header)?;
            self.header = header;
        }
        self.csv.write_record(fields.iter().map(|(_, value)| value))?;
        self.records += 1;
        Ok(())
    }

    /// Writes one sampled record.
    pub fn write_record(&mut self, record: &SampleRecord) -> Result<(), WriteError> {
        self.begin_record();
        for (label, field) in record.fields() {
            self.add_field(label, field);
        }
        self.commit()
    }

    /// Flushes buffered rows to the underlying stream.
    pub fn flush(&mut self) -> Result<(), WriteError> {
        self.csv.flush()?;
        Ok(())
    }

    /// The pinned header; empty until the first commit.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Number of data rows written.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes and returns the underlying stream.
    pub fn into_inner(self) -> Result<W, WriteError> {
        self.csv
            .into_inner()
            .map_err(|e| WriteError::Io(e.into_error()))
    }
}
