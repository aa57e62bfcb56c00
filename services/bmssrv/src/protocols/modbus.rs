//! Modbus master: register/channel codec, task model and TCP/RTU transports

pub mod codec;
pub mod connection;
pub mod constants;
pub mod pdu;
pub mod task;
pub mod transport;

pub use codec::{ElementKind, RegisterElement, WordOrder};
pub use connection::{ModbusClient, ModbusTransport};
pub use pdu::{ModbusPdu, PduBuilder};
pub use task::{Operation, Priority, Task, WriteRun};
pub use transport::{ModbusFrameProcessor, ModbusMode};
