use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use common::domain::{DeviceMapping, DomainError, DomainResult, IngestionMessage, NormalizedTelemetry};
use serde_json::{Map, Value};

const DEVICE_ID_KEYS: [&str; 2] = ["deviceId", "device_id"];
const GATEWAY_ID_KEYS: [&str; 2] = ["gatewayId", "gateway_id"];
const CORRELATION_ID_KEYS: [&str; 2] = ["correlationId", "correlation_id"];
const TIMESTAMP_KEYS: [&str; 1] = ["timestamp"];
const SEQUENCE_KEYS: [&str; 1] = ["sequence"];
const TOTAL_KEYS: [&str; 1] = ["total"];

/// Structural validation and normalization of inbound payloads.
///
/// The envelope fields are lifted out of the JSON object; every other
/// top-level field is carried verbatim in `payload`. Tenant resolution is not
/// done here.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryValidator;

impl TelemetryValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, message: &IngestionMessage) -> DomainResult<NormalizedTelemetry> {
        let value: Value = serde_json::from_slice(&message.raw_payload)
            .map_err(|e| DomainError::InvalidPayload(format!("payload is not valid JSON: {}", e)))?;

        let Value::Object(mut fields) = value else {
            return Err(DomainError::InvalidPayload(
                "payload must be a JSON object".to_string(),
            ));
        };

        let device_id = take_string(&mut fields, &DEVICE_ID_KEYS)?;
        let gateway_id = take_string(&mut fields, &GATEWAY_ID_KEYS)?;
        let correlation_id = take_string(&mut fields, &CORRELATION_ID_KEYS)?;
        let timestamp = take_string(&mut fields, &TIMESTAMP_KEYS)?
            .map(|raw| parse_timestamp(&raw))
            .transpose()?
            .unwrap_or(message.received_at);
        let sequence = take_positive(&mut fields, &SEQUENCE_KEYS)?;
        let total = take_positive(&mut fields, &TOTAL_KEYS)?;

        let device_id = device_id
            .or_else(|| dev_eui(&fields))
            .or_else(|| device_id_from_topic(&message.topic))
            .ok_or_else(|| DomainError::MissingDeviceId(message.topic.clone()))?;

        if let (Some(sequence), Some(total)) = (sequence, total) {
            if sequence > total {
                return Err(DomainError::InvalidPayload(format!(
                    "sequence {} exceeds total {}",
                    sequence, total
                )));
            }
        }

        if correlation_id.is_some() && sequence.is_none() {
            return Err(DomainError::InvalidPayload(
                "correlated message without a sequence number".to_string(),
            ));
        }

        Ok(NormalizedTelemetry {
            external_id: DeviceMapping::normalize_external_id(&device_id),
            gateway_id,
            correlation_id,
            sequence,
            total,
            timestamp,
            received_at: message.received_at,
            payload: fields,
        })
    }
}

/// Remove the first present key and return it as a non-empty string.
/// `null` counts as absent.
fn take_string(fields: &mut Map<String, Value>, keys: &[&str]) -> DomainResult<Option<String>> {
    let Some(value) = take_first(fields, keys) else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.trim().to_string())),
        other => Err(DomainError::InvalidPayload(format!(
            "field '{}' must be a string, got {}",
            keys[0], other
        ))),
    }
}

fn take_positive(fields: &mut Map<String, Value>, keys: &[&str]) -> DomainResult<Option<u32>> {
    let Some(value) = take_first(fields, keys) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }

    let parsed = value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            DomainError::InvalidPayload(format!(
                "field '{}' must be a positive integer, got {}",
                keys[0], value
            ))
        })?;

    if parsed == 0 {
        return Err(DomainError::InvalidPayload(format!(
            "field '{}' must be at least 1",
            keys[0]
        )));
    }
    Ok(Some(parsed))
}

fn take_first(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        // Remove every alias so none of them leak into the payload
        if let Some(value) = fields.remove(*key) {
            found.get_or_insert(value);
        }
    }
    found
}

/// ISO-8601 forms with an explicit offset, beyond what RFC 3339 covers
const OFFSET_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y%m%dT%H%M%S%.f%z",
];

/// Local forms; a missing offset is read as UTC
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y%m%dT%H%M%S%.f",
    "%Y%m%dT%H%M%S%.fZ",
];

fn parse_timestamp(raw: &str) -> DomainResult<DateTime<Utc>> {
    let rfc3339_error = match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => return Ok(ts.with_timezone(&Utc)),
        Err(e) => e,
    };

    for format in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Ok(ts.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }

    Err(DomainError::InvalidPayload(format!(
        "invalid timestamp '{}': {}",
        raw, rfc3339_error
    )))
}

/// ChirpStack uplinks carry the DevEUI under `deviceInfo.devEui`
fn dev_eui(fields: &Map<String, Value>) -> Option<String> {
    ["deviceInfo", "device_info"]
        .iter()
        .filter_map(|key| fields.get(*key))
        .find_map(|info| info.get("devEui").or_else(|| info.get("dev_eui")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Device id carried by the topic itself.
///
/// Recognizes `devices/{id}/telemetry` and any topic with a `device/{id}`
/// pair such as ChirpStack's `application/{app}/device/{devEui}/event/up`.
pub fn device_id_from_topic(topic: &str) -> Option<String> {
    let segments: Vec<&str> = topic.split('/').collect();

    let candidate = match segments.as_slice() {
        ["devices", id, "telemetry"] => Some(*id),
        _ => segments
            .windows(2)
            .find(|pair| pair[0] == "device")
            .map(|pair| pair[1]),
    };

    candidate
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != "+" && *id != "#")
        .map(String::from)
}
