//! MarketPsych bulletin payloads.
//!
//! A bulletin is newline-delimited text: a timestamp banner, a tab-separated
//! header row, data rows, and an optional trailing comment that ends the
//! table. Parsing runs a four-state machine over the lines; a bad banner or
//! header rejects the whole payload, a bad row only skips that row.

use chrono::NaiveDateTime;
use tracing::warn;

use crate::error::ParseError;

/// Four-byte prefix identifying a well-formed bulletin.
pub const MAGIC: &[u8; 4] = b"# Ma";

const BANNER_PREFIX: &str = "# MarketPsych Engine Version ";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIMESTAMP_LEN: usize = "2012-05-02 21:19:00".len();

/// One parsed bulletin table.
#[derive(Debug, Clone, PartialEq)]
pub struct Bulletin {
    pub engine_version: String,
    pub open_time: NaiveDateTime,
    pub close_time: NaiveDateTime,
    /// Column labels; column 0 names the row key and carries no data.
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    /// One value per metric column; NaN for unparseable cells.
    pub values: Vec<f64>,
}

/// True when `body` starts with the bulletin magic.
pub fn has_magic(body: &[u8]) -> bool {
    body.len() >= MAGIC.len() && &body[..MAGIC.len()] == MAGIC
}

enum State {
    Timestamp,
    Header,
    Row,
    Fin,
}

/// Parse a complete bulletin body.
pub fn parse(body: &str) -> Result<Bulletin, ParseError> {
    let mut state = State::Timestamp;
    let mut engine_version = String::new();
    let mut open_time: Option<NaiveDateTime> = None;
    let mut close_time: Option<NaiveDateTime> = None;
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<Row> = Vec::new();

    for line in body.lines() {
        match state {
            State::Timestamp => {
                // # MarketPsych Engine Version x.y | 2012-05-02 21:19:00 UTC - 2012-05-03 21:19:00 UTC
                let rest = line
                    .strip_prefix(BANNER_PREFIX)
                    .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
                let space = rest
                    .find(' ')
                    .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
                engine_version = rest[..space].to_string();

                let pipe = rest
                    .find("| ")
                    .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
                open_time = Some(parse_timestamp(&rest[pipe + 2..])?);

                let hyphen = rest[pipe..]
                    .find("- ")
                    .map(|i| pipe + i)
                    .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
                close_time = Some(parse_timestamp(&rest[hyphen + 2..])?);

                state = State::Header;
            }
            State::Header => {
                // Sector<TAB>Buzz<TAB>Sentiment...
                columns = line.split('\t').map(str::to_string).collect();
                if columns.len() < 2 {
                    return Err(ParseError::MalformedColumns(line.to_string()));
                }
                state = State::Row;
            }
            State::Row => {
                // 1679<TAB>0.00131<TAB>0.00131...
                if line.starts_with('#') {
                    state = State::Fin;
                    continue;
                }
                let cells: Vec<&str> = line.split('\t').collect();
                if cells.len() != columns.len() {
                    warn!(row = %line, "skipping row with mismatched column count");
                    continue;
                }
                let values = cells[1..]
                    .iter()
                    .map(|cell| cell.trim().parse::<f64>().unwrap_or(f64::NAN))
                    .collect();
                rows.push(Row { key: cells[0].to_string(), values });
            }
            State::Fin => break,
        }
    }

    match (open_time, close_time) {
        (Some(open_time), Some(close_time)) if !columns.is_empty() => Ok(Bulletin {
            engine_version,
            open_time,
            close_time,
            columns,
            rows,
        }),
        _ => Err(ParseError::MissingHeader),
    }
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, ParseError> {
    if text.len() < TIMESTAMP_LEN {
        return Err(ParseError::BadTimestamp(text.to_string()));
    }
    NaiveDateTime::parse_from_str(&text[..TIMESTAMP_LEN], TIMESTAMP_FORMAT)
        .map_err(|_| ParseError::BadTimestamp(text[..TIMESTAMP_LEN].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "# MarketPsych Engine Version 3.2 | 2024-01-02 00:00:00 UTC - 2024-01-02 00:01:00 UTC\n\
        Sector\tBuzz\tSentiment\n\
        1679\t0.00131\t-0.25\n\
        1680\tnan\tinf\n";

    #[test]
    fn test_magic() {
        assert!(has_magic(BODY.as_bytes()));
        assert!(!has_magic(b"HELLO"));
        assert!(!has_magic(b"# M"));
    }

    #[test]
    fn test_parse_happy_path() {
        let bulletin = parse(BODY).unwrap();
        assert_eq!(bulletin.engine_version, "3.2");
        assert_eq!(
            bulletin.open_time,
            NaiveDateTime::parse_from_str("2024-01-02 00:00:00", TIMESTAMP_FORMAT).unwrap()
        );
        assert_eq!(
            bulletin.close_time,
            NaiveDateTime::parse_from_str("2024-01-02 00:01:00", TIMESTAMP_FORMAT).unwrap()
        );
        assert_eq!(bulletin.columns, vec!["Sector", "Buzz", "Sentiment"]);
        assert_eq!(bulletin.rows.len(), 2);
        assert_eq!(bulletin.rows[0].key, "1679");
        assert_eq!(bulletin.rows[0].values, vec![0.00131, -0.25]);
    }

    #[test]
    fn test_nonfinite_tokens() {
        let bulletin = parse(BODY).unwrap();
        assert!(bulletin.rows[1].values[0].is_nan());
        assert!(bulletin.rows[1].values[1].is_infinite());
    }

    #[test]
    fn test_unparseable_cell_becomes_nan() {
        let body = BODY.replace("-0.25", "garbage");
        let bulletin = parse(&body).unwrap();
        assert!(bulletin.rows[0].values[1].is_nan());
    }

    #[test]
    fn test_comment_terminates_table() {
        let body = format!("{BODY}# trailer\n9999\t1.0\t2.0\n");
        let bulletin = parse(&body).unwrap();
        assert_eq!(bulletin.rows.len(), 2);
    }

    #[test]
    fn test_short_row_skipped_not_fatal() {
        let body = format!("{BODY}1681\t0.5\n");
        let bulletin = parse(&body).unwrap();
        assert_eq!(bulletin.rows.len(), 2);
    }

    #[test]
    fn test_bad_banner_rejected() {
        assert_eq!(
            parse("HELLO\nSector\tBuzz\n"),
            Err(ParseError::MalformedHeader("HELLO".to_string()))
        );
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let body = BODY.replace("2024-01-02 00:00:00", "2024-13-99 00:00:00");
        assert!(matches!(parse(&body), Err(ParseError::BadTimestamp(_))));
    }

    #[test]
    fn test_missing_pipe_rejected() {
        let body = BODY.replace(" | ", "   ");
        assert!(matches!(parse(&body), Err(ParseError::MalformedHeader(_))));
    }

    #[test]
    fn test_single_column_header_rejected() {
        let body = "# MarketPsych Engine Version 3.2 | 2024-01-02 00:00:00 UTC - 2024-01-02 00:01:00 UTC\nSector\n";
        assert!(matches!(parse(body), Err(ParseError::MalformedColumns(_))));
    }

    #[test]
    fn test_banner_only_rejected() {
        let body = "# MarketPsych Engine Version 3.2 | 2024-01-02 00:00:00 UTC - 2024-01-02 00:01:00 UTC\n";
        assert_eq!(parse(body), Err(ParseError::MissingHeader));
    }

    #[test]
    fn test_empty_table_is_ok() {
        let body = "# MarketPsych Engine Version 3.2 | 2024-01-02 00:00:00 UTC - 2024-01-02 00:01:00 UTC\nSector\tBuzz\n";
        let bulletin = parse(body).unwrap();
        assert!(bulletin.rows.is_empty());
    }
}
