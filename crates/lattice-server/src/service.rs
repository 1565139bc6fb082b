//! Echo service: answers `Ping` with `Pong` and echoes `Chat`.

use lattice_net::{SendError, SessionObserver, TcpSession, UdpSession};
use tracing::{debug, info};

use crate::messages::{DemoMessage, DemoTag};

/// Anything the service can reply on.
trait Reply {
    fn reply(&self, msg: &DemoMessage) -> Result<(), SendError>;
}

impl Reply for TcpSession<DemoMessage> {
    fn reply(&self, msg: &DemoMessage) -> Result<(), SendError> {
        self.send(msg)
    }
}

impl Reply for UdpSession<DemoMessage> {
    fn reply(&self, msg: &DemoMessage) -> Result<(), SendError> {
        self.send(msg)
    }
}

fn on_ping<S: Reply>(msg: DemoMessage, session: &S) {
    if let DemoMessage::Ping(seq) = msg
        && let Err(e) = session.reply(&DemoMessage::Pong(seq))
    {
        debug!("pong dropped: {e}");
    }
}

fn on_chat<S: Reply>(msg: DemoMessage, session: &S) {
    if let Err(e) = session.reply(&msg) {
        debug!("chat echo dropped: {e}");
    }
}

/// Session observer installing the echo handlers on every new session.
#[derive(Debug, Default)]
pub struct EchoService;

impl SessionObserver<TcpSession<DemoMessage>> for EchoService {
    fn on_connected(&self, session: &TcpSession<DemoMessage>) {
        session.register_handler(DemoTag::Ping, on_ping::<TcpSession<DemoMessage>>);
        session.register_handler(DemoTag::Chat, on_chat::<TcpSession<DemoMessage>>);
        info!(session = %session.id(), peer = ?session.peer_addr(), "tcp client joined");
    }

    fn on_closed(&self, session: &TcpSession<DemoMessage>) {
        info!(session = %session.id(), "tcp client left");
    }
}

impl SessionObserver<UdpSession<DemoMessage>> for EchoService {
    fn on_connected(&self, session: &UdpSession<DemoMessage>) {
        session.register_handler(DemoTag::Ping, on_ping::<UdpSession<DemoMessage>>);
        session.register_handler(DemoTag::Chat, on_chat::<UdpSession<DemoMessage>>);
        info!(conv = session.conv(), remote = %session.remote_addr(), "udp client joined");
    }

    fn on_closed(&self, session: &UdpSession<DemoMessage>) {
        info!(conv = session.conv(), "udp client left");
    }
}
