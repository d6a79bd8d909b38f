//! CSV-over-HTTP source tier (chart exports such as Etherscan's daily CSVs).

use async_trait::async_trait;
use ethpulse_core::{CsvTier, RawDate, RawRow, RawValue, Record};
use tracing::debug;

use crate::{
    get_body, normalize_rows, render_url, window_vars, within_window, AdapterContext, FetchError, FetchRequest,
    SourceAdapter,
};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone)]
pub struct CsvAdapter {
    spec: CsvTier,
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
}

impl CsvAdapter {
    pub fn new(spec: CsvTier) -> Self {
        Self { spec }
    }

    /// Parse a headered CSV body into raw rows keyed by the tier's column mapping.
    pub fn parse_body(
        &self,
        body: &[u8],
        dimension: Option<&str>,
    ) -> Result<Vec<RawRow>, FetchError> {
        let tier = &self.spec.source;
        let body = body.strip_prefix(UTF8_BOM).unwrap_or(body);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(body);

        let headers = reader
            .headers()
            .map_err(|e| FetchError::schema(tier, format!("unreadable CSV header: {e}")))?
            .clone();
        let date_idx = column_index(&headers, &self.spec.date_column).ok_or_else(|| {
            FetchError::schema(tier, format!("missing date column {:?}", self.spec.date_column))
        })?;
        let ts_idx = self
            .spec
            .timestamp_column
            .as_deref()
            .and_then(|name| column_index(&headers, name));
        let value_cols: Vec<(&String, usize)> = self
            .spec
            .values
            .iter()
            .filter_map(|(field, column)| column_index(&headers, column).map(|idx| (field, idx)))
            .collect();
        if value_cols.is_empty() {
            return Err(FetchError::schema(tier, "none of the value columns are present"));
        }

        let mut rows = Vec::new();
        for (line, result) in reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    debug!(tier = %tier, line, error = %err, "skipping malformed CSV line");
                    continue;
                }
            };
            let date = record.get(date_idx).unwrap_or_default();
            let mut raw = RawRow::new(RawDate::Text(date.to_string())).with_format(self.spec.date_format);
            raw.fallback_timestamp = ts_idx
                .and_then(|idx| record.get(idx))
                .and_then(|ts| ts.parse::<i64>().ok());
            raw.dimension = dimension.map(ToString::to_string);
            for (field, idx) in &value_cols {
                let cell = record
                    .get(*idx)
                    .map_or(RawValue::Missing, |v| RawValue::Text(v.to_string()));
                raw = raw.with_value((*field).clone(), cell);
            }
            rows.push(raw);
        }
        Ok(rows)
    }
}

#[async_trait]
impl SourceAdapter for CsvAdapter {
    fn source(&self) -> &str {
        &self.spec.source
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, FetchError> {
        let vars = window_vars(ctx, request, self.spec.api_key.as_deref());
        let url = render_url(&self.spec.source, &self.spec.url, &vars)?;
        let body = get_body(ctx, &self.spec.source, &url).await?;
        let rows = self.parse_body(&body, request.dimension)?;
        let records = normalize_rows(&self.spec.source, rows, request.metric);
        within_window(&self.spec.source, records, request.window)
    }
}
