//! Modbus connection management
//!
//! [`ModbusTransport`] is the seam between the bridge and the wire: one
//! request PDU in, one response PDU out. [`ModbusClient`] implements it over
//! TCP and serial RTU links; tests substitute an in-memory transport.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use super::constants::{MAX_RTU_FRAME, MBAP_HEADER_LEN};
use super::pdu::ModbusPdu;
use super::transport::{expected_rtu_length, MbapHeader, ModbusFrameProcessor, ModbusMode};
use crate::core::config::{Parity, TransportConfig};
use crate::error::{BmsError, Result};

/// Request/response exchange with Modbus slaves on one bus
#[async_trait]
pub trait ModbusTransport: Send {
    /// Establish the link; a no-op when already connected
    async fn connect(&mut self) -> Result<()>;

    /// Drop the link; the next `connect` re-establishes it
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Send one request and wait for its response
    ///
    /// Exception responses are returned as PDUs; the caller decides how to
    /// report them. The caller bounds the call with its request timeout.
    async fn exchange(&mut self, unit_id: u8, request: &ModbusPdu) -> Result<ModbusPdu>;

    /// Endpoint description for logs
    fn describe(&self) -> String;
}

/// Modbus connection type
#[derive(Debug)]
pub enum ModbusConnection {
    Tcp(TcpStream),
    Rtu(SerialStream),
}

impl ModbusConnection {
    pub async fn connect_tcp(host: &str, port: u16, timeout_duration: Duration) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        info!("Connecting to Modbus TCP endpoint: {}", addr);

        match timeout(timeout_duration, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                info!("Connected to Modbus TCP endpoint: {}", addr);
                Ok(ModbusConnection::Tcp(stream))
            },
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", addr, e);
                Err(BmsError::connection(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )))
            },
            Err(_) => {
                warn!("Connection to {} timed out", addr);
                Err(BmsError::connection(format!(
                    "Connection to {} timed out",
                    addr
                )))
            },
        }
    }

    pub fn connect_rtu(
        port: &str,
        baud_rate: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: Parity,
        timeout_duration: Duration,
    ) -> Result<Self> {
        info!("Opening serial port: {} at {} baud", port, baud_rate);

        let parity = match parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let data_bits = match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let serial = tokio_serial::new(port, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(timeout_duration)
            .open_native_async()
            .map_err(|e| {
                error!("Failed to open serial port {}: {}", port, e);
                BmsError::connection(format!("Failed to open serial port {}: {}", port, e))
            })?;

        info!("Opened serial port: {}", port);
        Ok(ModbusConnection::Rtu(serial))
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            ModbusConnection::Tcp(stream) => {
                stream
                    .write_all(data)
                    .await
                    .map_err(|e| BmsError::io(format!("TCP send error: {}", e)))?;
            },
            ModbusConnection::Rtu(port) => {
                port.write_all(data)
                    .await
                    .map_err(|e| BmsError::io(format!("Serial send error: {}", e)))?;
                port.flush()
                    .await
                    .map_err(|e| BmsError::io(format!("Serial flush error: {}", e)))?;
            },
        }
        debug!("Sent {} bytes", data.len());
        Ok(())
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = match self {
            ModbusConnection::Tcp(stream) => stream.read_exact(buf).await,
            ModbusConnection::Rtu(port) => port.read_exact(buf).await,
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(BmsError::connection("Connection closed by peer"))
            },
            Err(e) => Err(BmsError::io(format!("Receive error: {}", e))),
        }
    }
}

/// Modbus master over TCP or RTU
pub struct ModbusClient {
    config: TransportConfig,
    connect_timeout: Duration,
    processor: ModbusFrameProcessor,
    connection: Option<ModbusConnection>,
}

impl ModbusClient {
    pub fn new(config: TransportConfig, connect_timeout: Duration) -> Self {
        let mode = match config {
            TransportConfig::Tcp { .. } => ModbusMode::Tcp,
            TransportConfig::Rtu { .. } => ModbusMode::Rtu,
        };
        Self {
            config,
            connect_timeout,
            processor: ModbusFrameProcessor::new(mode),
            connection: None,
        }
    }

    async fn exchange_tcp(
        connection: &mut ModbusConnection,
        processor: &mut ModbusFrameProcessor,
        unit_id: u8,
        request: &ModbusPdu,
    ) -> Result<ModbusPdu> {
        let (frame, transaction_id) = processor.build_frame(unit_id, request);
        connection.send(&frame).await?;

        loop {
            let mut header = [0u8; MBAP_HEADER_LEN + 1];
            connection.read_exact(&mut header).await?;
            // A bad header means the byte stream lost framing
            let header = MbapHeader::parse(&header)
                .map_err(|e| BmsError::connection(format!("TCP stream desynchronized: {}", e)))?;

            let mut body = vec![0u8; header.pdu_len()];
            connection.read_exact(&mut body).await?;

            if Some(header.transaction_id) != transaction_id {
                debug!(
                    "Discarding stale response: trans_id={:04X}, expected {:?}",
                    header.transaction_id, transaction_id
                );
                continue;
            }
            if header.unit_id != unit_id {
                return Err(BmsError::wire(format!(
                    "Response from unit {}, expected {}",
                    header.unit_id, unit_id
                )));
            }
            return ModbusPdu::from_slice(&body);
        }
    }

    async fn exchange_rtu(
        connection: &mut ModbusConnection,
        processor: &mut ModbusFrameProcessor,
        unit_id: u8,
        request: &ModbusPdu,
    ) -> Result<ModbusPdu> {
        if let ModbusConnection::Rtu(port) = connection {
            if let Err(e) = port.clear(ClearBuffer::Input) {
                debug!("Failed to clear serial input buffer: {}", e);
            }
        }

        let (frame, _) = processor.build_frame(unit_id, request);
        connection.send(&frame).await?;

        let mut response = vec![0u8; 3];
        connection.read_exact(&mut response).await?;
        let total = expected_rtu_length(&response)
            .ok_or_else(|| BmsError::wire(format!("Unexpected RTU response: {:02X?}", response)))?;
        if total > MAX_RTU_FRAME || total < response.len() {
            return Err(BmsError::wire(format!("Invalid RTU frame length {}", total)));
        }
        response.resize(total, 0);
        connection.read_exact(&mut response[3..]).await?;

        let parsed = processor.parse_frame(&response)?;
        if parsed.unit_id != unit_id {
            return Err(BmsError::wire(format!(
                "Response from unit {}, expected {}",
                parsed.unit_id, unit_id
            )));
        }
        Ok(parsed.pdu)
    }
}

#[async_trait]
impl ModbusTransport for ModbusClient {
    async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let connection = match &self.config {
            TransportConfig::Tcp { host, port } => {
                ModbusConnection::connect_tcp(host, *port, self.connect_timeout).await?
            },
            TransportConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
            } => ModbusConnection::connect_rtu(
                port,
                *baud_rate,
                *data_bits,
                *stop_bits,
                *parity,
                self.connect_timeout,
            )?,
        };
        self.connection = Some(connection);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let ModbusConnection::Tcp(stream) = &mut connection {
                let _ = stream.shutdown().await;
            }
            info!("Disconnected from {}", self.describe());
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn exchange(&mut self, unit_id: u8, request: &ModbusPdu) -> Result<ModbusPdu> {
        let connection = self.connection.as_mut().ok_or_else(BmsError::not_connected)?;
        match self.processor.mode() {
            ModbusMode::Tcp => {
                Self::exchange_tcp(connection, &mut self.processor, unit_id, request).await
            },
            ModbusMode::Rtu => {
                Self::exchange_rtu(connection, &mut self.processor, unit_id, request).await
            },
        }
    }

    fn describe(&self) -> String {
        match &self.config {
            TransportConfig::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            TransportConfig::Rtu {
                port, baud_rate, ..
            } => format!("rtu://{}@{}", port, baud_rate),
        }
    }
}
