use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;

use super::api::TabularApi;
use super::types::{CellValue, SheetError};
use crate::config::StoreConfig;

/// Google Sheets v4 REST implementation of [`TabularApi`]
#[derive(Debug)]
pub struct HttpSheetsApi {
    client: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    access_token: Option<String>,
}

impl HttpSheetsApi {
    pub fn new(config: &StoreConfig) -> Result<Self, SheetError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SheetError::Permanent(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SheetError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SheetError::Permanent(format!("Invalid API base URL '{}': {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| SheetError::Permanent(format!("API base URL '{}' cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .push("spreadsheets")
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, SheetError> {
        let segment = format!("{}{}", range, suffix);
        self.url(&[self.spreadsheet_id.as_str(), "values", segment.as_str()])
    }

    fn batch_update_url(&self) -> Result<Url, SheetError> {
        let segment = format!("{}:batchUpdate", self.spreadsheet_id);
        self.url(&[segment.as_str()])
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<Value, SheetError> {
        let mut request = self
            .client
            .request(method, url)
            .header("Accept", "application/json");

        if let Some(ref token) = self.access_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(classify_response(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| SheetError::Permanent(format!("Malformed response body: {}", e)))
    }
}

#[async_trait]
impl TabularApi for HttpSheetsApi {
    async fn read_values(&self, sheet: &str) -> Result<Vec<Vec<CellValue>>, SheetError> {
        let mut url = self.values_url(&quote_sheet(sheet), "")?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE")
            .append_pair("dateTimeRenderOption", "FORMATTED_STRING");

        let body = self.send(Method::GET, url, None).await?;
        Ok(parse_values(&body))
    }

    async fn read_header(&self, sheet: &str) -> Result<Vec<String>, SheetError> {
        let range = format!("{}!1:1", quote_sheet(sheet));
        let mut url = self.values_url(&range, "")?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "FORMATTED_VALUE");

        let body = self.send(Method::GET, url, None).await?;
        Ok(parse_values(&body)
            .into_iter()
            .next()
            .map(|row| row.iter().map(CellValue::as_text).collect())
            .unwrap_or_default())
    }

    async fn append_rows(&self, sheet: &str, rows: &[Vec<CellValue>]) -> Result<u32, SheetError> {
        let range = format!("{}!A1", quote_sheet(sheet));
        let mut url = self.values_url(&range, ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        let body = json!({
            "majorDimension": "ROWS",
            "values": rows_to_json(rows),
        });
        let response = self.send(Method::POST, url, Some(body)).await?;

        response["updates"]["updatedRange"]
            .as_str()
            .and_then(parse_start_row)
            .ok_or_else(|| SheetError::Permanent("Append response carried no updated range".to_string()))
    }

    async fn write_row(&self, sheet: &str, row_index: u32, cells: &[CellValue]) -> Result<(), SheetError> {
        let range = row_range(sheet, row_index, cells.len());
        let mut url = self.values_url(&range, "")?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");

        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": [cells.iter().map(CellValue::to_json).collect::<Vec<_>>()],
        });
        self.send(Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn clear_row(&self, sheet: &str, row_index: u32) -> Result<(), SheetError> {
        if row_index < 2 {
            return Err(SheetError::Permanent(format!("Refusing to clear row {}", row_index)));
        }
        let url = self.values_url(&whole_row_range(sheet, row_index), ":clear")?;
        self.send(Method::POST, url, Some(json!({}))).await?;
        Ok(())
    }

    async fn sheet_names(&self) -> Result<Vec<String>, SheetError> {
        let mut url = self.url(&[self.spreadsheet_id.as_str()])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties.title");

        let body = self.send(Method::GET, url, None).await?;
        let mut names: Vec<String> = body["sheets"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|sheet| sheet["properties"]["title"].as_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn add_sheet(&self, sheet: &str) -> Result<(), SheetError> {
        let body = json!({
            "requests": [{ "addSheet": { "properties": { "title": sheet } } }]
        });
        self.send(Method::POST, self.batch_update_url()?, Some(body)).await?;
        Ok(())
    }
}

/// Map a non-success HTTP response onto the error taxonomy
pub fn classify_response(status: StatusCode, body: &str) -> SheetError {
    let message = format!("HTTP {}: {}", status.as_u16(), error_message(body));
    let lower = body.to_ascii_lowercase();
    let quota = lower.contains("rate_limit_exceeded")
        || lower.contains("ratelimitexceeded")
        || lower.contains("quota exceeded");

    match status.as_u16() {
        429 => SheetError::RateLimited(message),
        403 if quota => SheetError::RateLimited(message),
        401 | 403 => SheetError::Auth(message),
        404 => SheetError::NotFound(message),
        400 if lower.contains("unable to parse range") => SheetError::NotFound(message),
        408 => SheetError::Transient(message),
        500..=599 => SheetError::Transient(message),
        _ => SheetError::Permanent(message),
    }
}

fn transport_error(err: reqwest::Error) -> SheetError {
    if err.is_decode() || err.is_builder() {
        SheetError::Permanent(format!("Request failed: {}", err))
    } else {
        SheetError::Transient(format!("Request failed: {}", err))
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn parse_values(body: &Value) -> Vec<Vec<CellValue>> {
    body["values"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(CellValue::from_json).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn rows_to_json(rows: &[Vec<CellValue>]) -> Vec<Vec<Value>> {
    rows.iter()
        .map(|row| row.iter().map(CellValue::to_json).collect())
        .collect()
}

/// Quote a sheet title for A1 notation
fn quote_sheet(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

/// A1 range covering `width` cells of one row
fn row_range(sheet: &str, row_index: u32, width: usize) -> String {
    let last = column_index_to_letter(width.saturating_sub(1) as u32);
    format!("{}!A{}:{}{}", quote_sheet(sheet), row_index, last, row_index)
}

/// A1 range covering every column of one row
fn whole_row_range(sheet: &str, row_index: u32) -> String {
    format!("{}!{}:{}", quote_sheet(sheet), row_index, row_index)
}

/// Convert column index (0-based) to column letters (A, B, ..., Z, AA, AB, ...)
fn column_index_to_letter(index: u32) -> String {
    let mut result = String::new();
    let mut n = index + 1;

    while n > 0 {
        n -= 1;
        let c = (b'A' + (n % 26) as u8) as char;
        result.insert(0, c);
        n /= 26;
    }

    result
}

/// First row number of a range such as `'tasks'!A5:L7`
fn parse_start_row(range: &str) -> Option<u32> {
    let cells = range.rsplit('!').next()?;
    let start = cells.split(':').next()?;
    start
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_index_to_letter() {
        assert_eq!(column_index_to_letter(0), "A");
        assert_eq!(column_index_to_letter(25), "Z");
        assert_eq!(column_index_to_letter(26), "AA");
        assert_eq!(column_index_to_letter(52), "BA");
    }

    #[test]
    fn test_ranges() {
        assert_eq!(row_range("tasks", 5, 12), "'tasks'!A5:L5");
        assert_eq!(whole_row_range("tasks", 7), "'tasks'!7:7");
        assert_eq!(quote_sheet("Bob's"), "'Bob''s'");
        assert_eq!(parse_start_row("'tasks'!A5:L7"), Some(5));
        assert_eq!(parse_start_row("tasks!A12"), Some(12));
        assert_eq!(parse_start_row("garbage"), None);
    }

    #[test]
    fn test_classify_response() {
        let quota = r#"{"error":{"code":403,"message":"Quota exceeded for quota metric 'Read requests'","status":"PERMISSION_DENIED"}}"#;

        assert!(matches!(classify_response(StatusCode::TOO_MANY_REQUESTS, ""), SheetError::RateLimited(_)));
        assert!(matches!(classify_response(StatusCode::FORBIDDEN, quota), SheetError::RateLimited(_)));
        assert!(matches!(classify_response(StatusCode::UNAUTHORIZED, "{}"), SheetError::Auth(_)));
        assert!(matches!(classify_response(StatusCode::FORBIDDEN, "denied"), SheetError::Auth(_)));
        assert!(matches!(classify_response(StatusCode::SERVICE_UNAVAILABLE, ""), SheetError::Transient(_)));
        assert!(matches!(
            classify_response(StatusCode::BAD_REQUEST, r#"{"error":{"message":"Unable to parse range: 'x'!A1"}}"#),
            SheetError::NotFound(_)
        ));
        assert!(matches!(classify_response(StatusCode::BAD_REQUEST, "bad"), SheetError::Permanent(_)));
    }

    #[test]
    fn test_error_message_prefers_api_message() {
        let err = classify_response(StatusCode::BAD_REQUEST, r#"{"error":{"message":"Invalid values"}}"#);
        assert_eq!(err.to_string(), "request rejected: HTTP 400: Invalid values");
    }

    #[test]
    fn test_parse_values_handles_missing_and_short_rows() {
        let body = json!({"values": [["id", "name"], ["a"], [], ["b", 3]]});
        let rows = parse_values(&body);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], vec![CellValue::String("a".into())]);
        assert!(rows[2].is_empty());
        assert_eq!(rows[3][1], CellValue::Number(3.0));

        assert!(parse_values(&json!({"range": "'t'!A1:Z1000"})).is_empty());
    }

    #[test]
    fn test_urls_encode_ranges() {
        let config = StoreConfig {
            spreadsheet_id: "sheet123".to_string(),
            ..StoreConfig::default()
        };
        let api = HttpSheetsApi::new(&config).unwrap();
        let url = api.values_url(&quote_sheet("my tasks"), ":append").unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/sheet123/values/'my%20tasks':append"
        );
        let clear = api.values_url(&whole_row_range("tasks", 3), ":clear").unwrap();
        assert_eq!(
            clear.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/sheet123/values/'tasks'!3:3:clear"
        );
        assert_eq!(
            api.batch_update_url().unwrap().as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/sheet123:batchUpdate"
        );
    }
}
