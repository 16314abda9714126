// src/publish/transform.rs

use csv::StringRecord;
use serde_json::Value;
use std::{fs::File, io::Read, path::Path, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};

use super::{
    event::{fields_from_json, Event, FieldValue},
    offset::apply_time_offset,
};
use crate::config::TransformerConfig;

/// Splunk's punctuation summary; never forwarded.
const PUNCT_FIELD: &str = "punct";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("time field `{0}` not found in header and no default timestamp configured")]
    MissingTimeField(String),
    #[error("invalid timestamp `{value}` in field `{field}`")]
    InvalidTimestamp { field: String, value: String },
    #[error("reading CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("opening {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata attributes that columns may fill when configuration leaves them empty.
struct Metadata {
    host: String,
    source: String,
    sourcetype: String,
    index: String,
}

impl Metadata {
    fn slot(&mut self, column: &str) -> Option<&mut String> {
        match column {
            "host" => Some(&mut self.host),
            "source" => Some(&mut self.source),
            "sourcetype" => Some(&mut self.sourcetype),
            "index" => Some(&mut self.index),
            _ => None,
        }
    }
}

/// Converts partition rows into collector events. Holds only read-only settings
/// and is shared freely between workers.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    config: Arc<TransformerConfig>,
}

impl EventTransformer {
    pub fn new(config: Arc<TransformerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Locate the time column. Its absence is fatal unless a default timestamp exists.
    pub fn time_index(&self, header: &[String]) -> Result<Option<usize>, TransformError> {
        let idx = header.iter().position(|h| *h == self.config.time_field);
        if idx.is_none() && self.config.default_timestamp.is_none() {
            return Err(TransformError::MissingTimeField(
                self.config.time_field.clone(),
            ));
        }
        Ok(idx)
    }

    /// Build one event from `row`.
    ///
    /// `sourcetype` overrides the configured sourcetype when non-empty. Fails only
    /// with [`TransformError::InvalidTimestamp`], and only when invalid rows are
    /// to be discarded.
    pub fn transform_row(
        &self,
        header: &[String],
        row: &StringRecord,
        time_idx: Option<usize>,
        sourcetype: &str,
    ) -> Result<Event, TransformError> {
        let cfg = &*self.config;
        let time = self.resolve_time(row, time_idx)?;

        let mut meta = Metadata {
            host: cfg.host.clone(),
            source: cfg.source.clone(),
            sourcetype: if sourcetype.is_empty() {
                cfg.sourcetype.clone()
            } else {
                sourcetype.to_string()
            },
            index: cfg.index.clone(),
        };

        let raw_json = header
            .iter()
            .position(|h| *h == cfg.raw_field)
            .and_then(|idx| row.get(idx))
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| serde_json::from_str::<serde_json::Map<String, Value>>(raw).ok());
        let raw_mode = raw_json.is_some();
        let mut fields = raw_json.map(fields_from_json).unwrap_or_default();

        for (idx, (name, value)) in header.iter().zip(row.iter()).enumerate() {
            if Some(idx) == time_idx || name == PUNCT_FIELD {
                continue;
            }
            if let Some(slot) = meta.slot(name) {
                if slot.is_empty() && !value.is_empty() {
                    *slot = value.to_string();
                }
                continue;
            }
            if raw_mode || cfg.exclude_fields.contains(name) {
                continue;
            }

            let target = match cfg.field_mappings.get(name) {
                Some(mapped) => mapped.as_str(),
                None if cfg.strict_mapping => continue,
                None => name.as_str(),
            };
            if value.is_empty() && !cfg.preserve_nulls {
                continue;
            }
            fields.insert(target.to_string(), FieldValue::from(value));
        }

        for (name, value) in &cfg.constant_fields {
            fields.insert(name.clone(), FieldValue::from(value.as_str()));
        }

        let mut event = Event {
            time,
            host: meta.host,
            source: meta.source,
            sourcetype: meta.sourcetype,
            index: meta.index,
            fields,
        };
        apply_time_offset(&mut event, cfg.time_offset);
        Ok(event)
    }

    fn resolve_time(
        &self,
        row: &StringRecord,
        time_idx: Option<usize>,
    ) -> Result<Option<i64>, TransformError> {
        let fallback = self.config.default_timestamp.map(|ts| ts.timestamp());
        let raw = match time_idx.and_then(|idx| row.get(idx)) {
            Some(raw) => raw,
            None => return Ok(fallback),
        };
        match self.config.time_format.parse_epoch_seconds(raw) {
            Some(ts) => Ok(Some(ts)),
            None if self.config.discard_invalid => Err(TransformError::InvalidTimestamp {
                field: self.config.time_field.clone(),
                value: raw.to_string(),
            }),
            None => {
                debug!(value = raw, "unparseable timestamp, using fallback");
                Ok(fallback)
            }
        }
    }

    /// Transform a whole table. Unreadable rows are skipped with a warning and
    /// rows with invalid timestamps are dropped when so configured.
    pub fn transform_reader<R: Read>(
        &self,
        reader: R,
        sourcetype: &str,
    ) -> Result<Vec<Event>, TransformError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let header: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        let time_idx = self.time_index(&header)?;

        let mut events = Vec::new();
        let mut discarded = 0u64;
        let mut record = StringRecord::new();
        loop {
            match rdr.read_record(&mut record) {
                Ok(false) => break,
                Ok(true) => match self.transform_row(&header, &record, time_idx, sourcetype) {
                    Ok(event) => events.push(event),
                    Err(TransformError::InvalidTimestamp { .. }) => discarded += 1,
                    Err(err) => return Err(err),
                },
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(err) => warn!(error = %err, "skipping unreadable row"),
            }
        }

        if discarded > 0 {
            debug!(discarded, "rows dropped for invalid timestamps");
        }
        Ok(events)
    }

    pub fn transform_file(&self, path: &Path, sourcetype: &str) -> Result<Vec<Event>, TransformError> {
        let file = File::open(path).map_err(|source| TransformError::Open {
            path: path.display().to_string(),
            source,
        })?;
        self.transform_reader(file, sourcetype)
    }
}

/// Partition key a table was written for, taken from its file name.
pub fn sourcetype_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TimeFormat, publish::event::Fields};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn transformer(cfg: TransformerConfig) -> EventTransformer {
        EventTransformer::new(Arc::new(cfg))
    }

    fn fields_of(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn header(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builds_event_from_columns() -> Result<(), TransformError> {
        let t = transformer(TransformerConfig::default());
        let h = header(&["_time", "msg", "date_hour", "punct", "empty", "host"]);
        let row = StringRecord::from(vec![
            "2024-01-01T00:00:10Z",
            "hello",
            "13",
            "__:_",
            "",
            "web-01",
        ]);
        let idx = t.time_index(&h)?;
        let event = t.transform_row(&h, &row, idx, "access")?;

        assert_eq!(event.time, Some(1_704_067_210));
        assert_eq!(event.sourcetype, "access");
        assert_eq!(event.host, "web-01");
        assert_eq!(event.fields, fields_of(&[("msg", "hello".into())]));
        Ok(())
    }

    #[test]
    fn configured_metadata_wins_over_columns() -> Result<(), TransformError> {
        let t = transformer(TransformerConfig {
            host: "collector-host".into(),
            index: "main".into(),
            sourcetype: "fallback".into(),
            ..TransformerConfig::default()
        });
        let h = header(&["_time", "host", "index", "sourcetype"]);
        let row = StringRecord::from(vec!["2024-01-01T00:00:00Z", "row-host", "", "row-st"]);
        let event = t.transform_row(&h, &row, Some(0), "")?;

        assert_eq!(event.host, "collector-host");
        assert_eq!(event.index, "main");
        assert_eq!(event.sourcetype, "fallback");
        assert!(event.fields.is_empty());
        Ok(())
    }

    #[test]
    fn raw_json_replaces_all_columns() -> Result<(), TransformError> {
        let t = transformer(TransformerConfig::default());
        let h = header(&["_time", "_raw", "other", "more"]);
        let row = StringRecord::from(vec!["2024-01-01T00:00:00Z", r#"{"k":1}"#, "x", "y"]);
        let event = t.transform_row(&h, &row, Some(0), "json")?;

        assert_eq!(serde_json::to_value(&event.fields).unwrap(), json!({"k": 1}));
        Ok(())
    }

    #[test]
    fn raw_text_is_an_ordinary_field() -> Result<(), TransformError> {
        let t = transformer(TransformerConfig::default());
        let h = header(&["_time", "_raw", "other"]);
        let row = StringRecord::from(vec!["2024-01-01T00:00:00Z", "plain line", "x"]);
        let event = t.transform_row(&h, &row, Some(0), "")?;

        assert_eq!(event.fields["_raw"].as_str(), Some("plain line"));
        assert_eq!(event.fields["other"].as_str(), Some("x"));
        Ok(())
    }

    #[test]
    fn mapping_strictness_nulls_and_constants() -> Result<(), TransformError> {
        let mut cfg = TransformerConfig {
            strict_mapping: true,
            preserve_nulls: true,
            ..TransformerConfig::default()
        };
        cfg.field_mappings.insert("src".into(), "src_ip".into());
        cfg.field_mappings.insert("note".into(), "note".into());
        cfg.constant_fields.insert("src_ip".into(), "pinned".into());
        cfg.constant_fields.insert("env".into(), "prod".into());
        let t = transformer(cfg);

        let h = header(&["_time", "src", "dst", "note"]);
        let row = StringRecord::from(vec!["2024-01-01T00:00:00Z", "10.0.0.1", "10.0.0.2", ""]);
        let event = t.transform_row(&h, &row, Some(0), "")?;

        assert_eq!(
            event.fields,
            fields_of(&[
                ("env", "prod".into()),
                ("note", "".into()),
                ("src_ip", "pinned".into()),
            ])
        );
        Ok(())
    }

    #[test]
    fn invalid_timestamps() -> Result<(), TransformError> {
        let h = header(&["_time", "msg"]);
        let row = StringRecord::from(vec!["not a time", "m"]);

        let keep = transformer(TransformerConfig::default());
        assert_eq!(keep.transform_row(&h, &row, Some(0), "")?.time, None);

        let default_ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let fallback = transformer(TransformerConfig {
            default_timestamp: Some(default_ts),
            ..TransformerConfig::default()
        });
        assert_eq!(
            fallback.transform_row(&h, &row, Some(0), "")?.time,
            Some(default_ts.timestamp())
        );

        let strict = transformer(TransformerConfig {
            discard_invalid: true,
            default_timestamp: Some(default_ts),
            ..TransformerConfig::default()
        });
        assert!(matches!(
            strict.transform_row(&h, &row, Some(0), ""),
            Err(TransformError::InvalidTimestamp { .. })
        ));
        Ok(())
    }

    #[test]
    fn missing_time_field_needs_a_default() {
        let h = header(&["msg"]);
        let t = transformer(TransformerConfig::default());
        assert!(matches!(
            t.time_index(&h),
            Err(TransformError::MissingTimeField(_))
        ));

        let with_default = transformer(TransformerConfig {
            default_timestamp: Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
            ..TransformerConfig::default()
        });
        assert!(matches!(with_default.time_index(&h), Ok(None)));
    }

    #[test]
    fn reader_drops_invalid_rows_and_applies_offset() -> Result<(), TransformError> {
        let t = transformer(TransformerConfig {
            discard_invalid: true,
            time_offset: Duration::hours(1),
            ..TransformerConfig::default()
        });
        let data = "_time,msg\n2024-01-01T00:00:00Z,seen 2024-01-01T00:00:00Z\nbogus,x\n2024-01-01T00:00:01Z,y\n";
        let events = t.transform_reader(data.as_bytes(), "app")?;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].time, Some(1_704_067_200 + 3_600));
        assert_eq!(
            events[0].fields["msg"].as_str(),
            Some("seen 2024-01-01T01:00:00Z")
        );
        assert!(events.iter().all(|e| e.sourcetype == "app"));
        Ok(())
    }

    #[test]
    fn out_of_range_epochs_are_invalid_rows() -> Result<(), TransformError> {
        let data = "_time,msg\ninf,a\nNaN,b\n9223372036854775807,c\n1704067200,d\n";
        let discard = transformer(TransformerConfig {
            time_format: TimeFormat::Epoch,
            discard_invalid: true,
            time_offset: Duration::hours(1),
            ..TransformerConfig::default()
        });
        let events = discard.transform_reader(data.as_bytes(), "app")?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, Some(1_704_067_200 + 3_600));

        let keep = transformer(TransformerConfig {
            time_format: TimeFormat::Epoch,
            time_offset: Duration::hours(1),
            ..TransformerConfig::default()
        });
        let times: Vec<_> = keep
            .transform_reader(data.as_bytes(), "app")?
            .iter()
            .map(|e| e.time)
            .collect();
        assert_eq!(times, vec![None, None, None, Some(1_704_067_200 + 3_600)]);
        Ok(())
    }

    #[test]
    fn file_stem_is_the_sourcetype() {
        assert_eq!(sourcetype_for(Path::new("/out/web_access.csv")), "web_access");
        assert_eq!(sourcetype_for(Path::new("syslog")), "syslog");
    }
}
