//! Connection handling and command execution.
//!
//! A [`Session`] owns the connection to a single device and executes
//! commands one at a time, matching responses by their command ID.
//!
//! A [`Worker`] runs a session on a dedicated task. Requests are submitted
//! through a [`Handle`] and executed in submission order, while status
//! changes and results are reported as [`Event`]s.

use crate::{ChecksumMode, Error as ProtocolError, Interface, Packet, battery::BatteryReading};
use core::fmt::{Display, Formatter};
use embedded_io_async::{ErrorType, Read, Write};
use log::{debug, info, warn};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender, error::SendError},
        watch,
    },
    task,
    time::{self, Duration, Instant},
};

/// A specialized [`Result`] type for [`Session`] operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for [`Session`] operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// The session is not connected.
    NotConnected,
    /// The connection attempt timed out.
    ConnectTimeout,
    /// The connection attempt failed.
    Connect(E),
    /// The device closed the connection.
    ConnectionClosed,
    /// Generic protocol error.
    Protocol(ProtocolError<E>),
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::ConnectTimeout => write!(f, "connection timed out"),
            Self::Connect(err) => write!(f, "connection error: {err}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<ProtocolError<E>> for Error<E> {
    fn from(err: ProtocolError<E>) -> Self {
        Self::Protocol(err)
    }
}

/// Opens connections to devices.
///
/// Implemented by transports such as [`serial::Connector`](crate::serial::Connector).
/// Closing a connection is done by dropping its port.
#[async_trait::async_trait(?Send)]
pub trait Connector {
    /// Port type of an established connection.
    type Port: Read + Write;

    /// Connects to the device with the given address.
    async fn connect(
        &mut self,
        address: &str,
    ) -> core::result::Result<Self::Port, <Self::Port as ErrorType>::Error>;
}

type PortError<C> = <<C as Connector>::Port as ErrorType>::Error;

/// Session configuration.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Config {
    /// Checksum policy for received packets.
    pub checksum: ChecksumMode,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Number of connection attempts per connect request.
    pub connect_attempts: u32,
    /// Delay between connection attempts.
    pub retry_delay: Duration,
    /// Time to wait for a response after sending a request.
    pub response_window: Duration,
}

impl Config {
    /// Constructs a configuration with default timeouts.
    ///
    /// The checksum policy has no sensible default and must be chosen explicitly.
    #[must_use]
    pub fn new(checksum: ChecksumMode) -> Self {
        Self {
            checksum,
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 1,
            retry_delay: Duration::from_secs(2),
            response_window: Duration::from_secs(3),
        }
    }
}

/// Connection state of a [`Session`].
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
pub enum State {
    /// No connection is open.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The connection is open and accepts commands.
    Connected,
}

/// Request/response session with a single device.
///
/// Only one command is in flight at a time, as responses can only be
/// told apart by their command ID.
/// Transport failures close the connection and return the session to
/// [`State::Disconnected`].
pub struct Session<C: Connector> {
    connector: C,
    address: String,
    config: Config,
    intf: Option<Interface<C::Port>>,
    state: State,
}

impl<C: Connector> Session<C> {
    /// Constructs a new, disconnected session.
    pub fn new(connector: C, address: impl Into<String>, config: Config) -> Self {
        Self {
            connector,
            address: address.into(),
            config,
            intf: None,
            state: State::Disconnected,
        }
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns the device address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connects to the device.
    ///
    /// Up to [`Config::connect_attempts`] attempts are made, each limited by
    /// [`Config::connect_timeout`]. Does nothing if already connected.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectTimeout`] if the last attempt timed out.
    /// - [`Error::Connect`] if the last attempt failed.
    pub async fn connect(&mut self) -> Result<(), PortError<C>> {
        if self.state == State::Connected {
            return Ok(());
        }

        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.state = State::Connecting;
            debug!(
                "Connecting to {} (attempt {attempt}/{attempts})",
                self.address
            );

            let res = match time::timeout(
                self.config.connect_timeout,
                self.connector.connect(&self.address),
            )
            .await
            {
                Ok(Ok(port)) => Ok(port),
                Ok(Err(err)) => Err(Error::Connect(err)),
                Err(_) => Err(Error::ConnectTimeout),
            };

            match res {
                Ok(port) => {
                    self.intf = Some(Interface::new(port, self.config.checksum));
                    self.state = State::Connected;
                    info!("Connected to {}", self.address);

                    return Ok(());
                }
                Err(err) if attempt >= attempts => {
                    self.state = State::Disconnected;
                    warn!("Failed to connect to {}: {err:?}", self.address);

                    return Err(err);
                }
                Err(err) => {
                    self.state = State::Disconnected;
                    debug!("Connection attempt {attempt} failed: {err:?}");
                    attempt += 1;
                    time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Closes the connection.
    ///
    /// Closing an already closed session has no effect.
    pub fn disconnect(&mut self) {
        if self.intf.take().is_some() {
            info!("Disconnected from {}", self.address);
        }

        self.state = State::Disconnected;
    }

    /// Queries the battery levels.
    ///
    /// Unrelated and invalid packets are skipped until a battery response
    /// arrives or [`Config::response_window`] elapses.
    /// Returns `None` if no usable response was received in time.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the session is not connected.
    /// - [`Error::ConnectionClosed`] if the device closed the connection.
    pub async fn query_battery(&mut self) -> Result<Option<BatteryReading>, PortError<C>> {
        let res = self.exchange_battery().await;

        self.check_connection(res)
    }

    /// Enables or disables the low-latency mode.
    ///
    /// The request does not require a response.
    /// The next packet received within [`Config::response_window`], if any,
    /// is returned for optional inspection.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the session is not connected.
    /// - [`Error::ConnectionClosed`] if the device closed the connection.
    pub async fn set_low_latency(&mut self, enabled: bool) -> Result<Option<Packet>, PortError<C>> {
        let res = self.exchange_low_latency(enabled).await;

        self.check_connection(res)
    }

    async fn exchange_battery(&mut self) -> Result<Option<BatteryReading>, PortError<C>> {
        let window = self.config.response_window;
        let intf = self.interface()?;

        intf.send(&Packet::battery_query()).await?;

        let deadline = Instant::now() + window;

        while Instant::now() < deadline {
            let Some(packet) = Self::receive(intf, deadline).await? else {
                continue;
            };

            match BatteryReading::from_packet(&packet) {
                Some(reading) if !reading.is_empty() => return Ok(Some(reading)),
                Some(_) => debug!("Ignoring battery response without levels"),
                None => debug!("Skipping unrelated packet {}", packet.command),
            }
        }

        warn!("Battery query timed out");

        Ok(None)
    }

    async fn exchange_low_latency(&mut self, enabled: bool) -> Result<Option<Packet>, PortError<C>> {
        let window = self.config.response_window;
        let intf = self.interface()?;

        intf.send(&Packet::low_latency(enabled)).await?;

        Self::receive(intf, Instant::now() + window).await
    }

    /// Receives the next packet, waiting until the deadline at most.
    ///
    /// Timeouts and invalid packets result in `None`.
    async fn receive(
        intf: &mut Interface<C::Port>,
        deadline: Instant,
    ) -> Result<Option<Packet>, PortError<C>> {
        match time::timeout_at(deadline, intf.receive()).await {
            Ok(Ok(None)) if intf.is_closed() => Err(Error::ConnectionClosed),
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(ProtocolError::MalformedPacket | ProtocolError::IncorrectChecksum)) => {
                debug!("Discarding invalid packet");

                Ok(None)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(None),
        }
    }

    fn interface(&mut self) -> Result<&mut Interface<C::Port>, PortError<C>> {
        self.intf.as_mut().ok_or(Error::NotConnected)
    }

    /// Disconnects if the result indicates a transport failure.
    fn check_connection<T>(&mut self, res: Result<T, PortError<C>>) -> Result<T, PortError<C>> {
        if matches!(
            res,
            Err(Error::ConnectionClosed | Error::Protocol(ProtocolError::Io(_)))
        ) {
            self.disconnect();
        }

        res
    }
}

/// Kind of a request submitted to a [`Worker`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum RequestKind {
    /// Connect to the device.
    Connect,
    /// Query the battery levels.
    QueryBattery,
    /// Enable or disable the low-latency mode.
    SetLowLatency(bool),
    /// Close the connection.
    Disconnect,
}

/// Request waiting for execution by a [`Worker`].
#[derive(Debug)]
pub struct CommandRequest {
    /// Requested command.
    pub kind: RequestKind,
    /// Time of submission.
    pub issued_at: Instant,
}

/// Notification emitted by a [`Worker`].
#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    /// Human-readable status message.
    Status(String),
    /// The connection state changed.
    State(State),
    /// Battery levels were received.
    Battery(BatteryReading),
    /// The low-latency mode was set.
    LowLatency(bool),
}

/// Submits requests to a running [`Worker`].
///
/// Dropping the handle stops the worker once all submitted requests
/// have been executed.
#[derive(Debug)]
pub struct Handle {
    tx: UnboundedSender<CommandRequest>,
    stop: watch::Sender<bool>,
}

impl Handle {
    /// Requests a connection to the device.
    pub fn connect(&self) -> core::result::Result<(), SendError<CommandRequest>> {
        self.submit(RequestKind::Connect)
    }

    /// Requests the battery levels.
    pub fn query_battery(&self) -> core::result::Result<(), SendError<CommandRequest>> {
        self.submit(RequestKind::QueryBattery)
    }

    /// Requests enabling or disabling the low-latency mode.
    pub fn set_low_latency(&self, enabled: bool) -> core::result::Result<(), SendError<CommandRequest>> {
        self.submit(RequestKind::SetLowLatency(enabled))
    }

    /// Requests closing the connection.
    pub fn disconnect(&self) -> core::result::Result<(), SendError<CommandRequest>> {
        self.submit(RequestKind::Disconnect)
    }

    /// Submits a request for execution.
    pub fn submit(&self, kind: RequestKind) -> core::result::Result<(), SendError<CommandRequest>> {
        self.tx.send(CommandRequest {
            kind,
            issued_at: Instant::now(),
        })
    }

    /// Signals the worker to stop.
    ///
    /// The worker finishes its current request first.
    /// Requests still waiting in the queue are not executed.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

/// Executes session requests on a dedicated task.
pub struct Worker<C: Connector> {
    session: Session<C>,
    rx: UnboundedReceiver<CommandRequest>,
    stop: watch::Receiver<bool>,
    events: UnboundedSender<Event>,
    state: State,
}

impl<C> Worker<C>
where
    C: Connector + 'static,
    PortError<C>: core::error::Error,
{
    /// Constructs a worker for the session.
    ///
    /// Returns the worker, a handle for submitting requests and
    /// the receiving end of the event channel.
    pub fn new(session: Session<C>) -> (Self, Handle, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = Self {
            state: session.state(),
            session,
            rx,
            stop: stop_rx,
            events: event_tx,
        };
        let handle = Handle { tx, stop: stop_tx };

        (worker, handle, event_rx)
    }

    /// Spawns a worker for the session on the current [`task::LocalSet`].
    pub fn start(session: Session<C>) -> (Handle, UnboundedReceiver<Event>) {
        let (worker, handle, events) = Self::new(session);

        task::spawn_local(worker.run());

        (handle, events)
    }

    /// Executes requests until stopped or until the handle is dropped
    /// and the queue is empty.
    ///
    /// The session is disconnected before returning.
    pub async fn run(mut self) {
        loop {
            let req = tokio::select! {
                biased;
                Ok(_) = self.stop.wait_for(|&stop| stop) => None,
                req = self.rx.recv() => req,
            };

            let Some(req) = req else {
                break;
            };

            self.execute(req).await;
        }

        self.session.disconnect();
        self.sync_state();
        debug!("Worker stopped");
    }

    async fn execute(&mut self, req: CommandRequest) {
        debug!(
            "Executing {:?} (queued for {:?})",
            req.kind,
            req.issued_at.elapsed()
        );

        match req.kind {
            RequestKind::Connect => self.connect().await,
            RequestKind::QueryBattery => self.query_battery().await,
            RequestKind::SetLowLatency(enabled) => self.set_low_latency(enabled).await,
            RequestKind::Disconnect => {
                self.session.disconnect();
                self.sync_state();
                self.status("Disconnected".to_string());
            }
        }

        self.sync_state();
    }

    async fn connect(&mut self) {
        if self.session.state() == State::Connected {
            self.status("Already connected".to_string());

            return;
        }

        self.state = State::Connecting;
        self.notify(Event::State(State::Connecting));
        self.status(format!("Connecting to {}...", self.session.address()));

        let res = self.session.connect().await;

        self.sync_state();

        match res {
            Ok(()) => self.status(format!("Connected to {}", self.session.address())),
            Err(err) => self.status(format!("Failed to connect ({err})")),
        }
    }

    async fn query_battery(&mut self) {
        match self.session.query_battery().await {
            Ok(Some(reading)) => self.notify(Event::Battery(reading)),
            Ok(None) => self.status("Battery query timed out".to_string()),
            Err(Error::NotConnected) => self.status("Not connected".to_string()),
            Err(err) => self.status(format!("Battery query failed ({err})")),
        }
    }

    async fn set_low_latency(&mut self, enabled: bool) {
        match self.session.set_low_latency(enabled).await {
            Ok(resp) => {
                debug!("Low-latency response: {resp:x?}");
                self.notify(Event::LowLatency(enabled));
            }
            Err(Error::NotConnected) => self.status("Not connected".to_string()),
            Err(err) => self.status(format!("Failed to set low-latency mode ({err})")),
        }
    }

    /// Emits a state event if the session state changed.
    fn sync_state(&mut self) {
        let state = self.session.state();

        if state != self.state {
            self.state = state;
            self.notify(Event::State(state));
        }
    }

    fn status(&self, text: String) {
        debug!("Status: {text}");
        self.notify(Event::Status(text));
    }

    fn notify(&self, event: Event) {
        // Receiver might be gone, events are fire-and-forget
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandId, Field, tests::init_logger};
    use core::cell::RefCell;
    use embedded_io_async::ErrorKind;
    use std::{collections::VecDeque, rc::Rc};

    const ADDRESS: &str = "90:F6:44:AA:EE:67";

    #[derive(PartialEq, Eq, Debug)]
    struct MockError;

    impl Display for MockError {
        fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
            write!(f, "mock error")
        }
    }

    impl core::error::Error for MockError {}

    impl embedded_io_async::Error for MockError {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// Port replaying canned data.
    ///
    /// Once the data is exhausted, reads either block forever (`stall`)
    /// or report end-of-file.
    struct MockPort {
        rx: VecDeque<u8>,
        tx: Rc<RefCell<Vec<u8>>>,
        stall: bool,
    }

    impl ErrorType for MockPort {
        type Error = MockError;
    }

    impl Read for MockPort {
        async fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, MockError> {
            if self.rx.is_empty() {
                if self.stall {
                    core::future::pending::<()>().await;
                }

                return Ok(0);
            }

            let len = buf.len().min(self.rx.len());

            for (dst, src) in buf.iter_mut().zip(self.rx.drain(..len)) {
                *dst = src;
            }

            Ok(len)
        }
    }

    impl Write for MockPort {
        async fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, MockError> {
            self.tx.borrow_mut().extend_from_slice(buf);

            Ok(buf.len())
        }

        async fn flush(&mut self) -> core::result::Result<(), MockError> {
            Ok(())
        }
    }

    /// Connector handing out prepared ports.
    ///
    /// Connection attempts hang once all ports are used up.
    struct MockConnector {
        ports: VecDeque<core::result::Result<MockPort, MockError>>,
    }

    #[async_trait::async_trait(?Send)]
    impl Connector for MockConnector {
        type Port = MockPort;

        async fn connect(&mut self, address: &str) -> core::result::Result<MockPort, MockError> {
            assert_eq!(address, ADDRESS, "address should be correct");

            match self.ports.pop_front() {
                Some(res) => res,
                None => core::future::pending().await,
            }
        }
    }

    fn port(packets: &[Packet], stall: bool) -> (MockPort, Rc<RefCell<Vec<u8>>>) {
        let tx = Rc::new(RefCell::new(Vec::new()));
        let rx = packets
            .iter()
            .flat_map(|packet| packet.encode().unwrap())
            .collect();
        let port = MockPort {
            rx,
            tx: tx.clone(),
            stall,
        };

        (port, tx)
    }

    fn session(ports: Vec<core::result::Result<MockPort, MockError>>) -> Session<MockConnector> {
        Session::new(
            MockConnector {
                ports: ports.into(),
            },
            ADDRESS,
            Config::new(ChecksumMode::Enforce),
        )
    }

    fn battery_response(levels: [u8; 3]) -> Packet {
        Packet::new(CommandId::BATTERY, vec![Field::new(2, levels)])
    }

    #[tokio::test(start_paused = true)]
    async fn query_battery() -> Result<(), MockError> {
        init_logger();

        let (mut port, tx) = port(
            &[
                Packet::new(CommandId::from(0x0127), vec![Field::new(1, [0x10])]),
                battery_response([40, 45, 99]),
            ],
            true,
        );

        // Garbage preceding the packets
        for b in [0x00, 0x13, 0x37].into_iter().rev() {
            port.rx.push_front(b);
        }

        let mut sess = session(vec![Ok(port)]);

        sess.connect().await?;

        assert_eq!(sess.state(), State::Connected, "session should be connected");

        let reading = sess.query_battery().await?;

        assert_eq!(
            reading,
            Some(BatteryReading::from_raw(40, 45, 99)),
            "reading should be correct"
        );
        assert_eq!(
            *tx.borrow(),
            [
                0x5a, 0x00, 0x09, 0x00, 0x01, 0x08, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0xfb, 0xb9
            ],
            "sent data should be correct"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn query_battery_skips_empty_response() -> Result<(), MockError> {
        init_logger();

        let (port, _) = port(
            &[
                Packet::new(CommandId::BATTERY, vec![Field::new(9, [1, 2, 3])]),
                battery_response([0xff, 20, 30]),
            ],
            true,
        );
        let mut sess = session(vec![Ok(port)]);

        sess.connect().await?;

        assert_eq!(
            sess.query_battery().await?,
            Some(BatteryReading::from_raw(0xff, 20, 30)),
            "reading should be correct"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn query_battery_timeout() -> Result<(), MockError> {
        init_logger();

        let (port, _) = port(&[Packet::low_latency(true)], true);
        let mut sess = session(vec![Ok(port)]);

        sess.connect().await?;

        let start = Instant::now();

        assert_eq!(sess.query_battery().await?, None, "no reading should be returned");
        assert!(
            start.elapsed() >= Duration::from_secs(3),
            "query should wait for the response window"
        );
        assert_eq!(sess.state(), State::Connected, "session should stay connected");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn query_battery_incomplete_response() -> Result<(), MockError> {
        init_logger();

        let (mut port, _) = port(&[], true);
        let frame = battery_response([40, 45, 99]).encode().unwrap();

        port.rx.extend(&frame[..frame.len() - 3]);

        let mut sess = session(vec![Ok(port)]);

        sess.connect().await?;

        let start = Instant::now();

        assert_eq!(sess.query_battery().await?, None, "no reading should be returned");
        assert!(
            start.elapsed() >= Duration::from_secs(3),
            "query should wait for the response window"
        );
        assert_eq!(sess.state(), State::Connected, "session should stay connected");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn query_battery_connection_closed() {
        init_logger();

        let (port, _) = port(&[], false);
        let mut sess = session(vec![Ok(port)]);

        sess.connect().await.unwrap();

        assert_eq!(
            sess.query_battery().await,
            Err(Error::ConnectionClosed),
            "result should be connection closed error"
        );
        assert_eq!(sess.state(), State::Disconnected, "session should be disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn error_not_connected() {
        init_logger();

        let mut sess = session(vec![]);

        assert_eq!(
            sess.query_battery().await,
            Err(Error::NotConnected),
            "result should be not connected error"
        );
        assert_eq!(
            sess.set_low_latency(true).await,
            Err(Error::NotConnected),
            "result should be not connected error"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_low_latency() -> Result<(), MockError> {
        init_logger();

        let resp = Packet::new(CommandId::LOW_LATENCY, vec![Field::new(2, [0x00])]);
        let (port, tx) = port(&[resp.clone()], true);
        let mut sess = session(vec![Ok(port)]);

        sess.connect().await?;

        assert_eq!(
            sess.set_low_latency(true).await?,
            Some(resp),
            "response should be returned"
        );
        assert_eq!(
            *tx.borrow(),
            [0x5a, 0x00, 0x06, 0x00, 0x2b, 0x6c, 0x01, 0x01, 0x01, 0xa4, 0x11],
            "sent data should be correct"
        );

        // Request succeeds without a response
        assert_eq!(sess.set_low_latency(false).await?, None, "no response should be returned");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn error_connect() {
        init_logger();

        let mut sess = session(vec![Err(MockError)]);

        assert_eq!(
            sess.connect().await,
            Err(Error::Connect(MockError)),
            "result should be connection error"
        );
        assert_eq!(sess.state(), State::Disconnected, "session should be disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn error_connect_timeout() {
        init_logger();

        let mut sess = session(vec![]);
        let start = Instant::now();

        assert_eq!(
            sess.connect().await,
            Err(Error::ConnectTimeout),
            "result should be connection timeout error"
        );
        assert!(
            start.elapsed() >= Duration::from_secs(5),
            "attempt should wait for the connection timeout"
        );
        assert_eq!(sess.state(), State::Disconnected, "session should be disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retry() -> Result<(), MockError> {
        init_logger();

        let (port, _) = port(&[], true);
        let mut sess = session(vec![Err(MockError), Err(MockError), Ok(port)]);

        sess.config.connect_attempts = 3;

        let start = Instant::now();

        sess.connect().await?;

        assert_eq!(sess.state(), State::Connected, "session should be connected");
        assert!(
            start.elapsed() >= Duration::from_secs(4),
            "attempts should be delayed"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_twice() -> Result<(), MockError> {
        init_logger();

        let (port, _) = port(&[], true);
        let mut sess = session(vec![Ok(port)]);

        sess.connect().await?;
        sess.disconnect();
        sess.disconnect();

        assert_eq!(sess.state(), State::Disconnected, "session should be disconnected");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn worker_executes_in_order() {
        init_logger();

        let (port, _) = port(
            &[
                battery_response([55, 60, 80]),
                Packet::new(CommandId::LOW_LATENCY, vec![Field::new(2, [0x00])]),
            ],
            true,
        );
        let (worker, handle, events) = Worker::new(session(vec![Ok(port)]));

        handle.connect().unwrap();
        handle.query_battery().unwrap();
        handle.set_low_latency(true).unwrap();

        let driver = async move {
            let mut events = events;
            let mut seen = Vec::new();

            while let Some(event) = events.recv().await {
                let done = event == Event::LowLatency(true);

                seen.push(event);

                if done {
                    break;
                }
            }

            handle.stop();

            (seen, events)
        };
        let ((), (seen, mut events)) = tokio::join!(worker.run(), driver);
        let seen: Vec<_> = seen
            .into_iter()
            .filter(|event| !matches!(event, Event::Status(_)))
            .collect();

        assert_eq!(
            seen,
            [
                Event::State(State::Connecting),
                Event::State(State::Connected),
                Event::Battery(BatteryReading::from_raw(55, 60, 80)),
                Event::LowLatency(true),
            ],
            "events should be correct"
        );
        assert_eq!(
            events.recv().await,
            Some(Event::State(State::Disconnected)),
            "worker should disconnect when stopped"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn worker_reports_status() {
        init_logger();

        let (worker, handle, events) = Worker::new(session(vec![Err(MockError)]));

        handle.query_battery().unwrap();
        handle.connect().unwrap();

        let driver = async move {
            let mut events = events;
            let mut seen = Vec::new();

            while let Some(event) = events.recv().await {
                let done = event == Event::State(State::Disconnected);

                seen.push(event);

                if done {
                    break;
                }
            }

            // Worker stops once the queue is drained
            drop(handle);

            seen
        };
        let ((), seen) = tokio::join!(worker.run(), driver);

        assert_eq!(
            seen,
            [
                Event::Status("Not connected".to_string()),
                Event::State(State::Connecting),
                Event::Status(format!("Connecting to {ADDRESS}...")),
                Event::State(State::Disconnected),
            ],
            "events should be correct"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_queue() {
        init_logger();

        let (worker, handle, mut events) = Worker::new(session(vec![]));

        handle.query_battery().unwrap();
        handle.disconnect().unwrap();
        drop(handle);
        worker.run().await;

        assert_eq!(
            events.recv().await,
            Some(Event::Status("Not connected".to_string())),
            "queued query should be executed"
        );
        assert_eq!(
            events.recv().await,
            Some(Event::Status("Disconnected".to_string())),
            "queued disconnect should be executed"
        );
        assert_eq!(events.recv().await, None, "event channel should be closed");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_stop_skips_queue() {
        init_logger();

        let (worker, handle, mut events) = Worker::new(session(vec![]));

        handle.query_battery().unwrap();
        handle.stop();
        worker.run().await;

        assert_eq!(events.recv().await, None, "no request should be executed");
    }
}
