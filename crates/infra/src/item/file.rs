//! Delimited file reading: tokenizer, field sets, record mappers and the
//! restartable [`FlatFileItemReader`], all on top of the `csv` crate.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};

use batchforge_core::ExecutionContext;

use super::{ItemError, ItemReader, ItemStream};

/// Named, positional tokens of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    names: Vec<String>,
    values: Vec<String>,
}

impl FieldSet {
    pub fn new(names: Vec<String>, values: Vec<String>) -> Self {
        Self { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    fn index_of(&self, name: &str) -> Result<usize, String> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| format!("no field named {name}"))
    }

    pub fn read_string(&self, name: &str) -> Result<&str, String> {
        let idx = self.index_of(name)?;
        self.values
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| format!("field {name} missing from record"))
    }

    pub fn read_trimmed(&self, name: &str) -> Result<&str, String> {
        self.read_string(name).map(str::trim)
    }

    pub fn read_int(&self, name: &str) -> Result<i64, String> {
        let raw = self.read_trimmed(name)?;
        raw.parse::<i64>()
            .map_err(|_| format!("field {name}: {raw:?} is not an integer"))
    }

    /// Like [`read_int`](Self::read_int) but an empty field reads as `None`.
    pub fn read_optional_int(&self, name: &str) -> Result<Option<i64>, String> {
        if self.read_trimmed(name)?.is_empty() {
            return Ok(None);
        }
        self.read_int(name).map(Some)
    }
}

/// Names the fields of a delimited record and checks its width.
///
/// Quoting follows RFC 4180: quoted fields may contain the delimiter, line
/// breaks and doubled quotes (`""` reads as one `"`). In strict mode the
/// field count must match the configured names exactly.
#[derive(Debug, Clone)]
pub struct DelimitedLineTokenizer {
    delimiter: u8,
    quote: u8,
    names: Vec<String>,
    strict: bool,
}

impl Default for DelimitedLineTokenizer {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            names: Vec::new(),
            strict: true,
        }
    }
}

impl DelimitedLineTokenizer {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_quote(mut self, quote: u8) -> Self {
        self.quote = quote;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn quote(&self) -> u8 {
        self.quote
    }

    /// A `csv` reader configured with this tokenizer's dialect. Headers and
    /// field counts are left to the caller.
    pub fn reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote);
        builder
    }

    /// Tokenize one standalone record.
    pub fn tokenize(&self, line: &str) -> Result<FieldSet, String> {
        let mut reader = self.reader_builder().from_reader(line.as_bytes());
        let mut record = StringRecord::new();
        reader
            .read_record(&mut record)
            .map_err(|e| format!("malformed record: {e}"))?;
        self.fields(&record)
    }

    /// Name the fields of an already split record.
    pub fn fields(&self, record: &StringRecord) -> Result<FieldSet, String> {
        let values: Vec<String> = record.iter().map(str::to_string).collect();
        if self.names.is_empty() {
            let names = (0..values.len()).map(|i| i.to_string()).collect();
            return Ok(FieldSet::new(names, values));
        }
        if self.strict && values.len() != self.names.len() {
            return Err(format!(
                "expected {} tokens, found {}",
                self.names.len(),
                values.len()
            ));
        }
        Ok(FieldSet::new(self.names.clone(), values))
    }
}

/// Turns one split record into an item.
pub trait LineMapper<T>: Send {
    fn map_record(&self, record: &StringRecord, line_number: u64) -> Result<T, ItemError>;
}

impl<T, F> LineMapper<T> for F
where
    F: Fn(&StringRecord, u64) -> Result<T, ItemError> + Send,
{
    fn map_record(&self, record: &StringRecord, line_number: u64) -> Result<T, ItemError> {
        self(record, line_number)
    }
}

/// Name the fields with a tokenizer, then map the [`FieldSet`] to an item.
///
/// Width and mapper failures both surface as [`ItemError::Parse`] tagged
/// with the line number of the record's first line.
pub struct DefaultLineMapper<T> {
    tokenizer: DelimitedLineTokenizer,
    field_set_mapper: Box<dyn Fn(&FieldSet) -> Result<T, String> + Send>,
}

impl<T> DefaultLineMapper<T> {
    pub fn new<F>(tokenizer: DelimitedLineTokenizer, field_set_mapper: F) -> Self
    where
        F: Fn(&FieldSet) -> Result<T, String> + Send + 'static,
    {
        Self {
            tokenizer,
            field_set_mapper: Box::new(field_set_mapper),
        }
    }

    pub fn tokenizer(&self) -> &DelimitedLineTokenizer {
        &self.tokenizer
    }

    /// Map a single line of text, outside any reader.
    pub fn map_line(&self, line: &str, line_number: u64) -> Result<T, ItemError> {
        let fields = self.tokenizer.tokenize(line).map_err(|message| ItemError::Parse {
            line: line_number,
            message,
        })?;
        self.map_fields(&fields, line_number)
    }

    fn map_fields(&self, fields: &FieldSet, line_number: u64) -> Result<T, ItemError> {
        (self.field_set_mapper)(fields).map_err(|message| ItemError::Parse {
            line: line_number,
            message,
        })
    }
}

impl<T> LineMapper<T> for DefaultLineMapper<T> {
    fn map_record(&self, record: &StringRecord, line_number: u64) -> Result<T, ItemError> {
        let fields = self.tokenizer.fields(record).map_err(|message| ItemError::Parse {
            line: line_number,
            message,
        })?;
        self.map_fields(&fields, line_number)
    }
}

/// Restartable reader over a delimited file.
///
/// The first `lines_to_skip` records (headers) are dropped on open. Empty
/// lines are ignored. The number of records handed out is saved under
/// `"{name}.read.count"`; reopening with that key present skips exactly that
/// many records before reading resumes.
pub struct FlatFileItemReader<T> {
    name: String,
    path: PathBuf,
    lines_to_skip: usize,
    strict: bool,
    delimiter: u8,
    quote: u8,
    line_mapper: Box<dyn LineMapper<T>>,
    input: Option<csv::Reader<File>>,
    record: StringRecord,
    read_count: u64,
}

impl<T> FlatFileItemReader<T> {
    pub fn new(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        line_mapper: impl LineMapper<T> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            lines_to_skip: 0,
            strict: true,
            delimiter: b',',
            quote: b'"',
            line_mapper: Box::new(line_mapper),
            input: None,
            record: StringRecord::new(),
            read_count: 0,
        }
    }

    pub fn lines_to_skip(mut self, lines: usize) -> Self {
        self.lines_to_skip = lines;
        self
    }

    /// In strict mode (the default) a missing file fails `open`; otherwise
    /// the reader logs a warning and behaves as empty.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn quote(mut self, quote: u8) -> Self {
        self.quote = quote;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn count_key(&self) -> String {
        format!("{}.read.count", self.name)
    }

    /// Next raw record and the line it starts on.
    ///
    /// A malformed record (bad UTF-8) is consumed and reported as
    /// [`ItemError::Parse`]; I/O failures are [`ItemError::Read`].
    fn next_record(&mut self) -> Result<Option<u64>, ItemError> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };
        match input.read_record(&mut self.record) {
            Ok(false) => Ok(None),
            Ok(true) => Ok(Some(self.record.position().map_or(0, |p| p.line()))),
            Err(e) => match e.kind() {
                csv::ErrorKind::Io(_) => Err(ItemError::read(format!("{}: {e}", self.path.display()))),
                _ => Err(ItemError::Parse {
                    line: e.position().map_or(0, |p| p.line()),
                    message: e.to_string(),
                }),
            },
        }
    }
}

impl<T> ItemStream for FlatFileItemReader<T> {
    fn open(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        self.read_count = 0;
        let builder = DelimitedLineTokenizer::default()
            .with_delimiter(self.delimiter)
            .with_quote(self.quote)
            .reader_builder();
        self.input = match builder.from_path(&self.path) {
            Ok(reader) => Some(reader),
            Err(e) if self.strict => {
                return Err(ItemError::stream(format!(
                    "{}: cannot open {}: {e}",
                    self.name,
                    self.path.display()
                )));
            }
            Err(e) => {
                tracing::warn!(reader = %self.name, path = %self.path.display(), error = %e, "input not readable, reading nothing");
                None
            }
        };

        for _ in 0..self.lines_to_skip {
            match self.next_record() {
                Ok(Some(_)) | Err(ItemError::Parse { .. }) => {}
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }

        if let Some(already_read) = ctx.get_u64(&self.count_key()) {
            while self.read_count < already_read {
                match self.next_record() {
                    Ok(Some(_)) | Err(ItemError::Parse { .. }) => self.read_count += 1,
                    Ok(None) => {
                        return Err(ItemError::stream(format!(
                            "{}: cannot restore position {already_read}, input ends after {} records",
                            self.name, self.read_count
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            tracing::debug!(reader = %self.name, skipped = already_read, "restored reader position");
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        ctx.put(self.count_key(), self.read_count);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ItemError> {
        self.input = None;
        Ok(())
    }
}

impl<T> ItemReader<T> for FlatFileItemReader<T> {
    fn read(&mut self) -> Result<Option<T>, ItemError> {
        // Counted before mapping so a restart never re-reads a bad record.
        let line_number = match self.next_record() {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(None),
            Err(e @ ItemError::Parse { .. }) => {
                self.read_count += 1;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.read_count += 1;
        self.line_mapper.map_record(&self.record, line_number).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tokenizer() -> DelimitedLineTokenizer {
        DelimitedLineTokenizer::new(["a", "b", "c"])
    }

    fn pair_mapper() -> DefaultLineMapper<(String, i64)> {
        DefaultLineMapper::new(
            DelimitedLineTokenizer::new(["name", "value"]),
            |fs: &FieldSet| Ok((fs.read_string("name")?.to_string(), fs.read_int("value")?)),
        )
    }

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn tokenizer_handles_quotes_and_escaped_quotes() {
        let fs = tokenizer().tokenize(r#"1,"Hello, ""world""",x"#).unwrap();
        assert_eq!(fs.values(), &["1", r#"Hello, "world""#, "x"]);
        assert_eq!(fs.read_string("b").unwrap(), r#"Hello, "world""#);
    }

    #[test]
    fn strict_tokenizer_rejects_wrong_column_count() {
        assert!(tokenizer().tokenize("1,2").is_err());
        assert!(tokenizer().strict(false).tokenize("1,2").is_ok());
    }

    #[test]
    fn tokenizer_keeps_empty_trailing_field() {
        let fs = tokenizer().tokenize("1,2,").unwrap();
        assert_eq!(fs.read_optional_int("c").unwrap(), None);
        assert_eq!(fs.read_int("a").unwrap(), 1);
        assert!(fs.read_int("zzz").is_err());
    }

    #[test]
    fn reader_skips_header_and_maps_records() {
        let file = write_file("name,value\nalpha,1\n\nbeta,2\n");
        let mut reader = FlatFileItemReader::new("pairs", file.path(), pair_mapper()).lines_to_skip(1);
        reader.open(&ExecutionContext::new()).unwrap();

        assert_eq!(reader.read().unwrap(), Some(("alpha".to_string(), 1)));
        assert_eq!(reader.read().unwrap(), Some(("beta".to_string(), 2)));
        assert_eq!(reader.read().unwrap(), None);
        reader.close().unwrap();
    }

    #[test]
    fn quoted_field_may_span_lines() {
        let file = write_file("\"multi\nline\",7\nnext,8\n");
        let mut reader = FlatFileItemReader::new("pairs", file.path(), pair_mapper());
        reader.open(&ExecutionContext::new()).unwrap();

        assert_eq!(reader.read().unwrap(), Some(("multi\nline".to_string(), 7)));
        assert_eq!(reader.read().unwrap(), Some(("next".to_string(), 8)));
    }

    #[test]
    fn parse_error_carries_line_number() {
        let file = write_file("h\nok,1\nbad,not-a-number\n");
        let mut reader = FlatFileItemReader::new("pairs", file.path(), pair_mapper()).lines_to_skip(1);
        reader.open(&ExecutionContext::new()).unwrap();
        reader.read().unwrap();

        match reader.read() {
            Err(ItemError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
        // The reader moves on past the bad record.
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn line_numbers_count_physical_lines_inside_quotes() {
        let file = write_file("name,value\n\"two\nlines\",1\nshort\nc,x\n");
        let mut reader = FlatFileItemReader::new("pairs", file.path(), pair_mapper()).lines_to_skip(1);
        reader.open(&ExecutionContext::new()).unwrap();
        reader.read().unwrap();

        match reader.read() {
            Err(ItemError::Parse { line, message }) => {
                assert_eq!(line, 4);
                assert!(message.contains("expected 2 tokens"), "{message}");
            }
            other => panic!("expected width error, got {other:?}"),
        }
        match reader.read() {
            Err(ItemError::Parse { line, .. }) => assert_eq!(line, 5),
            other => panic!("expected parse error, got {other:?}"),
        }
        let mut ctx = ExecutionContext::new();
        reader.update(&mut ctx).unwrap();
        assert_eq!(ctx.get_u64("pairs.read.count"), Some(3));
    }

    #[test]
    fn missing_file_fails_only_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.csv");

        let mut strict = FlatFileItemReader::new("pairs", &path, pair_mapper());
        assert!(matches!(strict.open(&ExecutionContext::new()), Err(ItemError::Stream(_))));

        let mut lenient = FlatFileItemReader::new("pairs", &path, pair_mapper()).strict(false);
        lenient.open(&ExecutionContext::new()).unwrap();
        assert_eq!(lenient.read().unwrap(), None);
    }

    #[test]
    fn restart_skips_records_already_read() {
        let file = write_file("h\na,1\nb,2\nc,3\n");
        let mut first = FlatFileItemReader::new("pairs", file.path(), pair_mapper()).lines_to_skip(1);
        first.open(&ExecutionContext::new()).unwrap();
        first.read().unwrap();
        first.read().unwrap();
        let mut ctx = ExecutionContext::new();
        first.update(&mut ctx).unwrap();
        first.close().unwrap();
        assert_eq!(ctx.get_u64("pairs.read.count"), Some(2));

        let mut second = FlatFileItemReader::new("pairs", file.path(), pair_mapper()).lines_to_skip(1);
        second.open(&ctx).unwrap();
        assert_eq!(second.read().unwrap(), Some(("c".to_string(), 3)));
        assert_eq!(second.read().unwrap(), None);
    }

    #[test]
    fn readers_with_different_names_do_not_collide() {
        let file = write_file("a,1\n");
        let mut ctx = ExecutionContext::new();
        ctx.put("other.read.count", 1u64);

        let mut reader = FlatFileItemReader::new("pairs", file.path(), pair_mapper());
        reader.open(&ctx).unwrap();
        assert_eq!(reader.read().unwrap(), Some(("a".to_string(), 1)));
    }
}
