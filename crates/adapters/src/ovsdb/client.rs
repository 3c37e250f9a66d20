//! Minimal OVSDB JSON-RPC client: enough `transact` to read and write
//! per-bridge `external_ids` and to discover patch-port numbers.
//!
//! Each call opens a fresh connection to the database socket. The round
//! store and port discovery run rarely (startup and replay), so a
//! short-lived blocking socket keeps the port trait synchronous.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};

use ports::secondary::external_ids_port::{ExternalIdsError, ExternalIdsPort};

const RPC_TIMEOUT: Duration = Duration::from_secs(5);

pub struct OvsdbClient {
    socket_path: PathBuf,
}

impl OvsdbClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// OpenFlow port number of a named interface, or `None` while the
    /// port has no assigned number yet.
    pub fn get_of_port(&self, interface: &str) -> Result<Option<u32>, ExternalIdsError> {
        let reply = self.transact(json!([
            "Open_vSwitch",
            {
                "op": "select",
                "table": "Interface",
                "where": [["name", "==", interface]],
                "columns": ["ofport"],
            }
        ]))?;
        let rows = result_rows(&reply)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(row.get("ofport").and_then(parse_ofport))
    }

    fn transact(&self, params: Value) -> Result<Value, ExternalIdsError> {
        let request = json!({
            "method": "transact",
            "params": params,
            "id": 0,
        });

        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| ExternalIdsError::Unreachable(e.to_string()))?;
        stream
            .set_read_timeout(Some(RPC_TIMEOUT))
            .map_err(|e| ExternalIdsError::Unreachable(e.to_string()))?;
        stream
            .write_all(request.to_string().as_bytes())
            .map_err(|e| ExternalIdsError::Unreachable(e.to_string()))?;

        // JSON-RPC over a stream has no length prefix; accumulate until
        // the buffer parses as one complete document.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream
                .read(&mut chunk)
                .map_err(|e| ExternalIdsError::Unreachable(e.to_string()))?;
            if n == 0 {
                return Err(ExternalIdsError::Malformed("connection closed".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Ok(value) = serde_json::from_slice::<Value>(&buf) {
                return Ok(value);
            }
        }
    }
}

impl ExternalIdsPort for OvsdbClient {
    fn get_external_ids(&self, bridge: &str) -> Result<HashMap<String, String>, ExternalIdsError> {
        let reply = self.transact(json!([
            "Open_vSwitch",
            {
                "op": "select",
                "table": "Bridge",
                "where": [["name", "==", bridge]],
                "columns": ["external_ids"],
            }
        ]))?;
        let rows = result_rows(&reply)?;
        let Some(row) = rows.first() else {
            return Err(ExternalIdsError::BridgeNotFound(bridge.to_string()));
        };
        parse_external_ids(row.get("external_ids"))
    }

    fn set_external_ids(
        &self,
        bridge: &str,
        ids: HashMap<String, String>,
    ) -> Result<(), ExternalIdsError> {
        let pairs: Vec<Value> = ids
            .into_iter()
            .map(|(k, v)| json!([k, v]))
            .collect();
        let reply = self.transact(json!([
            "Open_vSwitch",
            {
                "op": "update",
                "table": "Bridge",
                "where": [["name", "==", bridge]],
                "row": { "external_ids": ["map", pairs] },
            }
        ]))?;
        let results = reply
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| ExternalIdsError::Malformed("no result array".into()))?;
        for entry in results {
            if let Some(error) = entry.get("error") {
                return Err(ExternalIdsError::Malformed(error.to_string()));
            }
        }
        Ok(())
    }
}

fn result_rows(reply: &Value) -> Result<&Vec<Value>, ExternalIdsError> {
    reply
        .get("result")
        .and_then(Value::as_array)
        .and_then(|results| results.first())
        .and_then(|first| first.get("rows"))
        .and_then(Value::as_array)
        .ok_or_else(|| ExternalIdsError::Malformed("reply has no rows".into()))
}

/// `external_ids` arrives as `["map", [[k, v], …]]`.
fn parse_external_ids(value: Option<&Value>) -> Result<HashMap<String, String>, ExternalIdsError> {
    let mut out = HashMap::new();
    let Some(value) = value else {
        return Ok(out);
    };
    let pairs = value
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| ExternalIdsError::Malformed("external_ids is not a map".into()))?;
    for pair in pairs {
        let (Some(k), Some(v)) = (
            pair.get(0).and_then(Value::as_str),
            pair.get(1).and_then(Value::as_str),
        ) else {
            return Err(ExternalIdsError::Malformed(
                "external_ids pair is not two strings".into(),
            ));
        };
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}

/// `ofport` is a number, or `["set", []]` while unassigned.
fn parse_ofport(value: &Value) -> Option<u32> {
    match value.as_i64() {
        Some(port) if port > 0 => Some(port as u32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_external_ids_map() {
        let value = json!(["map", [["datapathRestartRound", "7"], ["other", "x"]]]);
        let ids = parse_external_ids(Some(&value)).unwrap();
        assert_eq!(ids.get("datapathRestartRound").map(String::as_str), Some("7"));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn empty_map_parses() {
        let value = json!(["map", []]);
        assert!(parse_external_ids(Some(&value)).unwrap().is_empty());
        assert!(parse_external_ids(None).unwrap().is_empty());
    }

    #[test]
    fn malformed_map_rejected() {
        let value = json!("not-a-map");
        assert!(parse_external_ids(Some(&value)).is_err());
    }

    #[test]
    fn result_rows_extraction() {
        let reply = json!({
            "id": 0,
            "result": [{"rows": [{"external_ids": ["map", []]}]}],
        });
        assert_eq!(result_rows(&reply).unwrap().len(), 1);
    }

    #[test]
    fn missing_result_is_malformed() {
        let reply = json!({"id": 0, "error": "nope"});
        assert!(result_rows(&reply).is_err());
    }

    #[test]
    fn ofport_number_parses() {
        assert_eq!(parse_ofport(&json!(17)), Some(17));
        // Unassigned ports arrive as an empty set or -1.
        assert_eq!(parse_ofport(&json!(["set", []])), None);
        assert_eq!(parse_ofport(&json!(-1)), None);
    }
}
