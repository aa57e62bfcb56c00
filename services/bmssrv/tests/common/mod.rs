//! Shared helpers for the bridge integration tests
//!
//! [`MockTransport`] is an in-memory Modbus slave bank. Clones share the same
//! register map and request log, so a test keeps one clone for inspection
//! while the bridge owns another.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bmssrv::core::channel::Channel;
use bmssrv::core::config::BmsConfig;
use bmssrv::error::{BmsError, Result};
use bmssrv::protocols::modbus::{ModbusPdu, ModbusTransport};
use bmssrv::runtime::bridge::Bridge;
use bmssrv::runtime::lifecycle::build_bridges;
use bmssrv::DeviceHandle;

const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const SLAVE_DEVICE_FAILURE: u8 = 0x04;

/// One request as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub function: u8,
    pub address: u16,
    pub words: Vec<u16>,
}

#[derive(Debug, Default)]
struct Bus {
    registers: HashMap<(u8, u16), u16>,
    requests: Vec<Request>,
    stalled: HashSet<(u8, u16)>,
    rejected_writes: HashSet<(u8, u16)>,
    refuse_connect: bool,
    drop_next: usize,
    connected: bool,
    connects: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    bus: Arc<Mutex<Bus>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, unit_id: u8, address: u16, value: u16) {
        self.bus.lock().unwrap().registers.insert((unit_id, address), value);
    }

    /// Define `count` registers from `start`, all holding `value`
    pub fn fill(&self, unit_id: u8, start: u16, count: u16, value: u16) {
        for address in start..start + count {
            self.set(unit_id, address, value);
        }
    }

    pub fn get(&self, unit_id: u8, address: u16) -> Option<u16> {
        self.bus.lock().unwrap().registers.get(&(unit_id, address)).copied()
    }

    /// Reads starting at `address` never get an answer
    pub fn stall(&self, unit_id: u8, address: u16, stalled: bool) {
        let mut bus = self.bus.lock().unwrap();
        if stalled {
            bus.stalled.insert((unit_id, address));
        } else {
            bus.stalled.remove(&(unit_id, address));
        }
    }

    /// Writes starting at `address` are answered with a slave failure exception
    pub fn reject_writes(&self, unit_id: u8, address: u16, rejected: bool) {
        let mut bus = self.bus.lock().unwrap();
        if rejected {
            bus.rejected_writes.insert((unit_id, address));
        } else {
            bus.rejected_writes.remove(&(unit_id, address));
        }
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.bus.lock().unwrap().refuse_connect = refuse;
    }

    /// The next `count` exchanges fail as if the link broke
    pub fn drop_next(&self, count: usize) {
        self.bus.lock().unwrap().drop_next = count;
    }

    pub fn connects(&self) -> usize {
        self.bus.lock().unwrap().connects
    }

    pub fn requests(&self) -> Vec<Request> {
        self.bus.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.bus.lock().unwrap().requests.clear();
    }

    /// Logged writes starting at `address`
    pub fn writes_to(&self, address: u16) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.function != 0x03 && r.address == address)
            .collect()
    }

    /// Number of logged reads starting at `address`
    pub fn reads_of(&self, address: u16) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.function == 0x03 && r.address == address)
            .count()
    }

    fn respond(bus: &mut Bus, unit_id: u8, request: &Request, raw: &[u8]) -> Vec<u8> {
        let exception = |code: u8| vec![request.function | 0x80, code];
        match request.function {
            0x03 => {
                let count = request.words.first().copied().unwrap_or(0);
                let mut data = vec![0x03, (count * 2) as u8];
                for address in request.address..request.address + count {
                    match bus.registers.get(&(unit_id, address)) {
                        Some(value) => data.extend_from_slice(&value.to_be_bytes()),
                        None => return exception(ILLEGAL_DATA_ADDRESS),
                    }
                }
                data
            },
            0x06 | 0x10 => {
                if bus.rejected_writes.contains(&(unit_id, request.address)) {
                    return exception(SLAVE_DEVICE_FAILURE);
                }
                for (i, word) in request.words.iter().enumerate() {
                    bus.registers.insert((unit_id, request.address + i as u16), *word);
                }
                if request.function == 0x06 {
                    raw.to_vec()
                } else {
                    let count = request.words.len() as u16;
                    let mut data = vec![0x10];
                    data.extend_from_slice(&request.address.to_be_bytes());
                    data.extend_from_slice(&count.to_be_bytes());
                    data
                }
            },
            _ => exception(0x01),
        }
    }
}

/// Parse a request PDU; for reads `words` holds the register count
fn parse(unit_id: u8, raw: &[u8]) -> Request {
    let word = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
    let function = raw[0];
    let words = match function {
        0x03 | 0x06 => vec![word(3)],
        0x10 => raw[6..].chunks_exact(2).map(|b| u16::from_be_bytes([b[0], b[1]])).collect(),
        _ => Vec::new(),
    };
    Request {
        unit_id,
        function,
        address: word(1),
        words,
    }
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut bus = self.bus.lock().unwrap();
        if bus.refuse_connect {
            return Err(BmsError::connection("Connection refused"));
        }
        if !bus.connected {
            bus.connected = true;
            bus.connects += 1;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.bus.lock().unwrap().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.bus.lock().unwrap().connected
    }

    async fn exchange(&mut self, unit_id: u8, request: &ModbusPdu) -> Result<ModbusPdu> {
        let raw = request.as_slice().to_vec();
        let parsed = parse(unit_id, &raw);

        let stalled = {
            let mut bus = self.bus.lock().unwrap();
            if !bus.connected {
                return Err(BmsError::not_connected());
            }
            bus.requests.push(parsed.clone());
            if bus.drop_next > 0 {
                bus.drop_next -= 1;
                return Err(BmsError::connection("Connection reset by peer"));
            }
            parsed.function == 0x03 && bus.stalled.contains(&(unit_id, parsed.address))
        };
        if stalled {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let response = {
            let mut bus = self.bus.lock().unwrap();
            Self::respond(&mut bus, unit_id, &parsed, &raw)
        };
        ModbusPdu::from_slice(&response)
    }

    fn describe(&self) -> String {
        "mock://bus".to_string()
    }
}

/// Registers of a single rack at `unit_id`, all zero except the contactor
pub fn single_rack_registers(mock: &MockTransport, unit_id: u8, contactor: u16) {
    mock.fill(unit_id, 0x2010, 1, contactor);
    mock.fill(unit_id, 0x2042, 1, 0);
    mock.fill(unit_id, 0x2046, 3, 0);
    mock.fill(unit_id, 0x2100, 0x17, 0);
    mock.fill(unit_id, 0x2140, 3, 0);
    mock.fill(unit_id, 0x2160, 2, 0);
    mock.fill(unit_id, 0x2185, 1, 0);
}

/// Cluster registers at `unit_id` with racks 1..=`racks` present
pub fn cluster_registers(mock: &MockTransport, unit_id: u8, racks: u8) {
    mock.fill(unit_id, 0x1004, 1, 0);
    mock.fill(unit_id, 0x1017, 6, 0);
    mock.fill(unit_id, 0x1044, 6, 0);
    mock.fill(unit_id, 0x104A, 6, 0);
    mock.fill(unit_id, 0x1081, 7, 0);
    for rack in 1..=racks {
        let offset = 0x1000 * (u16::from(rack) + 1);
        mock.fill(unit_id, offset + 0x04, 1, 0);
        mock.fill(unit_id, offset + 0x10, 1, 0);
        mock.fill(unit_id, offset + 0x1D, 1, 0);
    }
}

/// Build the single bridge of `yaml` over `mock`
pub fn bridge(yaml: &str, mock: &MockTransport) -> (Bridge<MockTransport>, Vec<DeviceHandle>) {
    let config: BmsConfig = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();
    let (mut bridges, handles) = build_bridges(&config, |_| mock.clone()).unwrap();
    assert_eq!(bridges.len(), 1);
    (bridges.remove(0), handles)
}

/// Channel `name` of the first device on `bridge`
pub fn channel<'a>(bridge: &'a Bridge<MockTransport>, name: &str) -> &'a Channel {
    let store = bridge.devices()[0].store();
    store.get(store.find(name).unwrap()).unwrap()
}
