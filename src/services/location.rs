//! Location service: the device reports the radio environment (Wi-Fi scan
//! results, cellular cells) and the cloud answers with a position estimate.

use std::time::Duration;

use bytes::Bytes;
use ciborium::value::Value;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  client::Client,
  coap::ContentType,
  error::{GolResult, Status},
  payload,
  scheduler::RequestKind,
};

const LOCATION_PATH: &str = "loc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellularType {
  LteCatM,
  NbIot,
}

impl CellularType {
  fn as_str(self) -> &'static str {
    match self {
      CellularType::LteCatM => "ltecatm",
      CellularType::NbIot => "nbiot",
    }
  }
}

#[derive(Debug, Clone)]
pub struct CellularInfo {
  pub cell_type: CellularType,
  pub mcc: u16,
  pub mnc: u16,
  pub id: u32,
  /// Signal strength in dBm, when known.
  pub strength: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct WifiScanResult {
  pub mac: [u8; 6],
  pub rssi: i32,
}

/// Position estimate from the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRsp {
  /// Latitude in nanodegrees.
  pub latitude: i64,
  /// Longitude in nanodegrees.
  pub longitude: i64,
  /// Accuracy in meters.
  pub accuracy: i64,
}

/// Builder for the network-environment document shared by the location
/// query and the net-info upload. The `wifi` and `cell` keys each appear
/// exactly once, `wifi` first.
#[derive(Default)]
pub struct NetworkInfo {
  wifi: Vec<Value>,
  cell: Vec<Value>,
  finished: bool,
}

impl NetworkInfo {
  pub fn new() -> NetworkInfo {
    NetworkInfo::default()
  }

  pub fn append_wifi(&mut self, result: &WifiScanResult) -> GolResult<()> {
    if self.finished {
      return Err(Status::InvalidState);
    }
    let mac = result
      .mac
      .iter()
      .map(|b| format!("{b:02x}"))
      .collect::<Vec<_>>()
      .join(":");
    self.wifi.push(Value::Map(vec![
      (Value::Text("mac".to_string()), Value::Text(mac)),
      (
        Value::Text("rss".to_string()),
        Value::Integer(result.rssi.into()),
      ),
    ]));
    Ok(())
  }

  pub fn append_cellular(&mut self, cell: &CellularInfo) -> GolResult<()> {
    if self.finished {
      return Err(Status::InvalidState);
    }
    let mut entries = vec![
      (
        Value::Text("type".to_string()),
        Value::Text(cell.cell_type.as_str().to_string()),
      ),
      (
        Value::Text("mcc".to_string()),
        Value::Integer(cell.mcc.into()),
      ),
      (
        Value::Text("mnc".to_string()),
        Value::Integer(cell.mnc.into()),
      ),
      (Value::Text("id".to_string()), Value::Integer(cell.id.into())),
    ];
    if let Some(strength) = cell.strength {
      entries.push((
        Value::Text("strength".to_string()),
        Value::Integer(strength.into()),
      ));
    }
    self.cell.push(Value::Map(entries));
    Ok(())
  }

  /// Seal the document. Fails with `Null` when nothing was appended.
  pub fn finish(&mut self) -> GolResult<()> {
    if self.finished {
      return Err(Status::InvalidState);
    }
    if self.wifi.is_empty() && self.cell.is_empty() {
      return Err(Status::Null);
    }
    self.finished = true;
    Ok(())
  }

  pub(crate) fn to_cbor(&self) -> GolResult<Bytes> {
    if !self.finished {
      return Err(Status::InvalidState);
    }
    let mut document = Vec::new();
    if !self.wifi.is_empty() {
      document.push((
        Value::Text("wifi".to_string()),
        Value::Array(self.wifi.clone()),
      ));
    }
    if !self.cell.is_empty() {
      document.push((
        Value::Text("cell".to_string()),
        Value::Array(self.cell.clone()),
      ));
    }
    let mut out = Vec::new();
    ciborium::ser::into_writer(&Value::Map(document), &mut out)
      .map_err(|_| Status::InvalidFormat)?;
    Ok(Bytes::from(out))
  }
}

fn value_as_i64(value: Option<&Value>) -> GolResult<i64> {
  match value {
    Some(Value::Integer(i)) => i64::try_from(i128::from(*i)).map_err(|_| Status::InvalidFormat),
    _ => Err(Status::InvalidFormat),
  }
}

fn parse_response(bytes: &[u8]) -> GolResult<LocationRsp> {
  let value: Value = ciborium::de::from_reader(bytes).map_err(|_| Status::InvalidFormat)?;
  let map = value.as_map().ok_or(Status::InvalidFormat)?;
  let field = |name: &str| {
    map
      .iter()
      .find(|(k, _)| k.as_text() == Some(name))
      .map(|(_, v)| v)
  };
  Ok(LocationRsp {
    latitude: value_as_i64(field("lat"))?,
    longitude: value_as_i64(field("lon"))?,
    accuracy: value_as_i64(field("acc"))?,
  })
}

/// Ask the cloud for a position estimate based on `info`.
pub fn get_sync(
  client: &Client,
  info: &NetworkInfo,
  timeout: Option<Duration>,
) -> GolResult<LocationRsp> {
  let response = client.request_sync(
    RequestKind::Post,
    LOCATION_PATH,
    ContentType::Cbor,
    ContentType::Cbor,
    info.to_cbor()?,
    timeout,
  )?;
  response.ok()?;
  if payload::payload_is_null(&response.payload) {
    return Err(Status::Null);
  }
  parse_response(&response.payload)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_wifi() -> WifiScanResult {
    WifiScanResult {
      mac: [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22],
      rssi: -61,
    }
  }

  fn sample_cell() -> CellularInfo {
    CellularInfo {
      cell_type: CellularType::LteCatM,
      mcc: 244,
      mnc: 91,
      id: 210205,
      strength: Some(-90),
    }
  }

  #[test]
  fn document_key_order_is_wifi_then_cell() {
    let mut info = NetworkInfo::new();
    info.append_cellular(&sample_cell()).unwrap();
    info.append_wifi(&sample_wifi()).unwrap();
    info.append_wifi(&sample_wifi()).unwrap();
    info.finish().unwrap();

    let bytes = info.to_cbor().unwrap();
    let value: Value = ciborium::de::from_reader(bytes.as_ref()).unwrap();
    let map = value.as_map().unwrap();
    assert_eq!(map.len(), 2); // each key exactly once
    assert_eq!(map[0].0.as_text(), Some("wifi"));
    assert_eq!(map[1].0.as_text(), Some("cell"));
    assert_eq!(map[0].1.as_array().unwrap().len(), 2);
    assert_eq!(map[1].1.as_array().unwrap().len(), 1);
  }

  #[test]
  fn wifi_entries_format_the_mac() {
    let mut info = NetworkInfo::new();
    info.append_wifi(&sample_wifi()).unwrap();
    info.finish().unwrap();
    let value: Value = ciborium::de::from_reader(info.to_cbor().unwrap().as_ref()).unwrap();
    let wifi = value.as_map().unwrap()[0].1.as_array().unwrap()[0].clone();
    let entry = wifi.as_map().unwrap();
    assert_eq!(entry[0].1.as_text(), Some("aa:bb:cc:00:11:22"));
    assert_eq!(entry[1].0.as_text(), Some("rss"));
  }

  #[test]
  fn empty_document_cannot_finish() {
    let mut info = NetworkInfo::new();
    assert_eq!(info.finish(), Err(Status::Null));
    assert_eq!(info.to_cbor(), Err(Status::InvalidState));
  }

  #[test]
  fn appends_after_finish_are_refused() {
    let mut info = NetworkInfo::new();
    info.append_wifi(&sample_wifi()).unwrap();
    info.finish().unwrap();
    assert_eq!(info.append_wifi(&sample_wifi()), Err(Status::InvalidState));
    assert_eq!(info.finish(), Err(Status::InvalidState));
  }

  #[test]
  fn response_parsing() {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(
      &Value::Map(vec![
        (
          Value::Text("lat".to_string()),
          Value::Integer(65_012_345_678i64.into()),
        ),
        (
          Value::Text("lon".to_string()),
          Value::Integer(25_987_654_321i64.into()),
        ),
        (Value::Text("acc".to_string()), Value::Integer(30.into())),
      ]),
      &mut bytes,
    )
    .unwrap();
    let rsp = parse_response(&bytes).unwrap();
    assert_eq!(rsp.latitude, 65_012_345_678);
    assert_eq!(rsp.longitude, 25_987_654_321);
    assert_eq!(rsp.accuracy, 30);

    assert!(parse_response(b"\xf6").is_err()); // CBOR null
  }
}
