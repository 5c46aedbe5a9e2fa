//! Delimited-text parsing for import uploads
//!
//! A [`TabularFile`] keeps the raw text and exposes the header list plus a
//! lazy row iterator. Iteration is restartable: every call to [`TabularFile::rows`]
//! re-reads from the first data row, so validation and execution can each walk
//! the file without buffering all rows in memory.

use csv::ReaderBuilder;

/// Input problems detected before any job exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("file is empty")]
    Empty,
    #[error("header row is missing or blank")]
    MissingHeader,
}

/// A parsed delimited file: trimmed headers plus re-readable row data.
#[derive(Debug, Clone, PartialEq)]
pub struct TabularFile {
    headers: Vec<String>,
    content: String,
    delimiter: u8,
}

impl TabularFile {
    /// Parse delimited text. When `delimiter` is `None` it is sniffed from the
    /// header row: a semicolon majority selects `;`, anything else `,`.
    pub fn parse(content: &str, delimiter: Option<u8>) -> Result<Self, ParseError> {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        if content.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let delimiter = delimiter.unwrap_or_else(|| sniff_delimiter(content));

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|_| ParseError::MissingHeader)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            return Err(ParseError::MissingHeader);
        }

        Ok(Self {
            headers,
            content: content.to_string(),
            delimiter,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Fresh iterator over the data rows, starting at row 1.
    pub fn rows(&self) -> Rows<'_> {
        let reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(self.content.as_bytes());

        Rows {
            headers: &self.headers,
            records: reader.into_records(),
            line: 0,
        }
    }

    /// Number of data rows, header excluded.
    pub fn row_count(&self) -> u32 {
        self.rows().count() as u32
    }
}

/// One data row with values keyed by their source header.
///
/// `line` is 1-based and counts data rows only; the header row is row 0 of the
/// file but never appears here.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub line: u32,
    fields: Vec<(String, String)>,
}

impl RawRow {
    /// Value under a source header. `None` when the header does not exist;
    /// `Some("")` when the cell is present but blank.
    pub fn get(&self, header: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == header)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// Lazy row iterator borrowed from a [`TabularFile`].
pub struct Rows<'a> {
    headers: &'a [String],
    records: csv::StringRecordsIntoIter<&'a [u8]>,
    line: u32,
}

impl Iterator for Rows<'_> {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        loop {
            match self.records.next()? {
                Ok(record) => {
                    self.line += 1;
                    // Rows shorter than the header are padded with empty
                    // values; fields beyond the header are dropped.
                    let fields = self
                        .headers
                        .iter()
                        .enumerate()
                        .map(|(i, name)| {
                            let value = record.get(i).unwrap_or("").trim().to_string();
                            (name.clone(), value)
                        })
                        .collect();
                    return Some(RawRow {
                        line: self.line,
                        fields,
                    });
                }
                // In-memory UTF-8 input parsed with flexible records produces
                // no record-level errors.
                Err(_) => continue,
            }
        }
    }
}

fn sniff_delimiter(content: &str) -> u8 {
    let header_line = content.lines().next().unwrap_or("");
    let semicolons = header_line.matches(';').count();
    let commas = header_line.matches(',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}
