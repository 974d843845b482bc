use std::time::Duration;

/// Settings for a [`crate::bus::MessageBus`].
#[derive(Clone, Debug, PartialEq)]
pub struct BusConfig {
    /// Allow unix fds in message bodies. Off unless the transport
    /// negotiated fd passing during authentication.
    pub negotiate_unix_fd: bool,
    /// Give up on a call with [`crate::error::Error::Timeout`] after this
    /// long. `None` waits until the reply or the end of the connection.
    pub call_timeout: Option<Duration>,
    /// Serial of the first message sent on each connection. Never zero.
    pub first_serial: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            negotiate_unix_fd: false,
            call_timeout: None,
            first_serial: 1,
        }
    }
}

impl BusConfig {
    pub fn with_unix_fd(mut self, negotiate_unix_fd: bool) -> Self {
        self.negotiate_unix_fd = negotiate_unix_fd;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_first_serial(mut self, serial: u32) -> Self {
        self.first_serial = serial.max(1);
        self
    }
}
