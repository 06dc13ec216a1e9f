use std::io::{self, Write};
use std::time::Duration;

use facegate_config::ActuatorSettings;
use serialport::SerialPort;
use tracing::{debug, error, info, warn};

use crate::errors::{AppError, AppResult};

/// Wire command understood by the lock controller.
pub const UNLOCK_COMMAND: &[u8] = b"UNLOCK\n";

/// Open byte channel to the lock controller.
pub trait ActuatorChannel {
    /// Write `bytes` in full and flush.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Opens fresh [`ActuatorChannel`]s; the gateway calls it on start-up and on reconnect.
pub trait ChannelConnector {
    fn describe(&self) -> String;
    fn connect(&self) -> AppResult<Box<dyn ActuatorChannel>>;
}

#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    write_timeout: Duration,
}

impl SerialConnector {
    pub fn new(settings: &ActuatorSettings) -> Self {
        Self {
            port: settings.port.clone(),
            baud_rate: settings.baud_rate,
            write_timeout: settings.write_timeout,
        }
    }
}

impl ChannelConnector for SerialConnector {
    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }

    fn connect(&self) -> AppResult<Box<dyn ActuatorChannel>> {
        let port = serialport::new(&self.port, self.baud_rate)
            .timeout(self.write_timeout)
            .open()
            .map_err(|err| AppError::ActuatorOpen {
                port: self.port.clone(),
                message: err.to_string(),
            })?;
        Ok(Box::new(SerialChannel { port }))
    }
}

struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl ActuatorChannel for SerialChannel {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

/// Owns the single persistent channel to the lock and its reconnect policy.
pub struct ActuatorGateway {
    connector: Box<dyn ChannelConnector>,
    channel: Option<Box<dyn ActuatorChannel>>,
}

impl ActuatorGateway {
    pub fn new(connector: Box<dyn ChannelConnector>) -> Self {
        Self {
            connector,
            channel: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Open the channel, replacing any existing one.
    pub fn connect(&mut self) -> AppResult<()> {
        self.channel = None;
        let channel = self.connector.connect()?;
        info!(channel = %self.connector.describe(), "actuator channel open");
        self.channel = Some(channel);
        Ok(())
    }

    /// Dispatch [`UNLOCK_COMMAND`]. Returns `true` once the command has been written.
    ///
    /// A missing or broken channel gets exactly one reconnect and one more write.
    pub fn unlock(&mut self) -> bool {
        if let Some(channel) = self.channel.as_mut() {
            match channel.send(UNLOCK_COMMAND) {
                Ok(()) => {
                    info!(target: "audit", "unlock command dispatched");
                    return true;
                }
                Err(err) => {
                    warn!("actuator write failed, reconnecting: {err}");
                    self.channel = None;
                }
            }
        }

        if let Err(err) = self.connect() {
            error!(target: "audit", "unlock not dispatched: {err}");
            return false;
        }

        let sent = match self.channel.as_mut() {
            Some(channel) => channel.send(UNLOCK_COMMAND),
            None => return false,
        };
        match sent {
            Ok(()) => {
                info!(target: "audit", "unlock command dispatched after reconnect");
                true
            }
            Err(err) => {
                self.channel = None;
                error!(target: "audit", "unlock not dispatched: {err}");
                false
            }
        }
    }

    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!(channel = %self.connector.describe(), "closed actuator channel");
        }
    }
}
