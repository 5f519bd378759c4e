//! JSON command payloads and datapoint extraction.

use crate::error::Result;
use crate::protocol::{CommandType, Version};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Datapoint values keyed by their numeric wire id.
pub type DpMap = BTreeMap<u32, Value>;

const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";

/// Commands whose payload is sent without the 15-byte version header.
pub const NO_PROTOCOL_HEADER_CMDS: &[CommandType] = &[
    CommandType::DpQuery,
    CommandType::DpQueryNew,
    CommandType::UpdateDps,
    CommandType::HeartBeat,
    CommandType::SessKeyNegStart,
    CommandType::SessKeyNegResp,
    CommandType::SessKeyNegFinish,
    CommandType::LanExtStream,
];

pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn dps_to_json(dps: &DpMap) -> Value {
    Value::Object(
        dps.iter()
            .map(|(id, value)| (id.to_string(), value.clone()))
            .collect(),
    )
}

/// Builds the JSON body for a command, handling version-specific command overrides.
///
/// Returns the command code actually sent (3.4+ devices expect `ControlNew` and
/// `DpQueryNew`) together with the body.
pub fn generate_payload(
    version: Version,
    device_id: &str,
    command: CommandType,
    dps: Option<&DpMap>,
    t: u64,
) -> (CommandType, Value) {
    let cmd_to_send = if version >= Version::V3_4 {
        match command {
            CommandType::Control => CommandType::ControlNew,
            CommandType::DpQuery => CommandType::DpQueryNew,
            other => other,
        }
    } else {
        command
    };

    let mut payload = Map::new();
    match cmd_to_send {
        CommandType::HeartBeat => {
            payload.insert(KEY_GW_ID.into(), device_id.into());
            payload.insert(KEY_DEV_ID.into(), device_id.into());
        }
        CommandType::ControlNew if version >= Version::V3_4 => {
            payload.insert(KEY_PROTOCOL.into(), 5.into());
            payload.insert(KEY_T.into(), t.into());
            let mut data = Map::new();
            if let Some(d) = dps {
                data.insert(KEY_DPS.into(), dps_to_json(d));
            }
            payload.insert(KEY_DATA.into(), Value::Object(data));
        }
        _ => {
            payload.insert(KEY_GW_ID.into(), device_id.into());
            payload.insert(KEY_DEV_ID.into(), device_id.into());
            payload.insert(KEY_UID.into(), device_id.into());
            payload.insert(KEY_T.into(), t.to_string().into());
            if let Some(d) = dps {
                payload.insert(KEY_DPS.into(), dps_to_json(d));
            }
        }
    }

    (cmd_to_send, Value::Object(payload))
}

/// Extracts datapoints from a device payload (`dps` at top level or under `data`).
///
/// Returns `Ok(None)` for JSON without datapoints; keys that are not numeric
/// (sub-device payloads, metadata) are skipped.
pub fn parse_dps(payload: &[u8]) -> Result<Option<DpMap>> {
    let value: Value = serde_json::from_slice(payload)?;
    let dps = value
        .get(KEY_DPS)
        .or_else(|| value.get(KEY_DATA).and_then(|d| d.get(KEY_DPS)));

    let Some(Value::Object(obj)) = dps else {
        return Ok(None);
    };

    Ok(Some(
        obj.iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (id, v.clone())))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_control_payload_carries_ids() {
        let dps = DpMap::from([(1, json!(true))]);
        let (cmd, body) =
            generate_payload(Version::V3_3, "bf01", CommandType::Control, Some(&dps), 1700);
        assert_eq!(cmd, CommandType::Control);
        assert_eq!(
            body,
            json!({"gwId": "bf01", "devId": "bf01", "uid": "bf01", "t": "1700", "dps": {"1": true}})
        );
    }

    #[test]
    fn v34_control_is_nested_and_renamed() {
        let dps = DpMap::from([(20, json!(false))]);
        let (cmd, body) =
            generate_payload(Version::V3_4, "bf01", CommandType::Control, Some(&dps), 1700);
        assert_eq!(cmd, CommandType::ControlNew);
        assert_eq!(
            body,
            json!({"protocol": 5, "t": 1700, "data": {"dps": {"20": false}}})
        );

        let (cmd, _) = generate_payload(Version::V3_5, "bf01", CommandType::DpQuery, None, 1700);
        assert_eq!(cmd, CommandType::DpQueryNew);
    }

    #[test]
    fn heartbeat_is_minimal() {
        let (cmd, body) = generate_payload(Version::V3_4, "bf01", CommandType::HeartBeat, None, 0);
        assert_eq!(cmd, CommandType::HeartBeat);
        assert_eq!(body, json!({"gwId": "bf01", "devId": "bf01"}));
    }

    #[test]
    fn parse_dps_reads_flat_and_nested_forms() {
        let flat = parse_dps(br#"{"devId":"x","dps":{"1":true,"2":"white"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(flat, DpMap::from([(1, json!(true)), (2, json!("white"))]));

        let nested = parse_dps(br#"{"protocol":4,"t":1,"data":{"dps":{"20":false}}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(nested, DpMap::from([(20, json!(false))]));
    }

    #[test]
    fn parse_dps_skips_non_numeric_keys_and_missing_dps() {
        let map = parse_dps(br#"{"dps":{"1":1,"cid":"abc"}}"#).unwrap().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(parse_dps(br#"{"devId":"x"}"#).unwrap(), None);
        assert!(parse_dps(b"data unvalid").is_err());
    }
}
