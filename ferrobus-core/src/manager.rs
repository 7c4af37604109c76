//! Channel manager: socket lifecycle and the unified poll.
//!
//! A [`ChannelManager`] owns a set of uniquely named channels sharing
//! one ZeroMQ context reference. Channels are created without sockets;
//! [`warm_up`](ChannelManager::warm_up) creates and configures the
//! sockets, [`wait`](ChannelManager::wait) multiplexes them into a
//! single poll, and [`shutdown`](ChannelManager::shutdown) tears
//! everything down deterministically.

use std::cell::RefCell;
use std::rc::Rc;

use crate::channel::{Channel, ChannelConfig, ManagedChannel};
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::types::{Direction, SocketKind};

/// Manager of ZeroMQ communication channels.
pub struct ChannelManager {
    ctx: zmq::Context,
    channels: Vec<(String, Rc<RefCell<dyn ManagedChannel>>)>,
    has_pollout: bool,
}

impl ChannelManager {
    /// Create a manager over a shared ZMQ context.
    ///
    /// The context is shared per process; the manager holds a
    /// reference but does not own it.
    pub fn new(ctx: zmq::Context) -> Self {
        Self { ctx, channels: Vec::new(), has_pollout: false }
    }

    /// The ZMQ context used by this manager.
    pub fn context(&self) -> &zmq::Context {
        &self.ctx
    }

    /// Create a new channel.
    ///
    /// The channel has no socket yet; sockets are created by
    /// [`warm_up`](Self::warm_up).
    ///
    /// # Errors
    ///
    /// Returns a channel error when the name is already taken.
    pub fn create_channel<P: Protocol>(
        &mut self,
        kind: SocketKind,
        name: &str,
        protocol: P,
        config: ChannelConfig,
    ) -> Result<Rc<RefCell<Channel<P>>>> {
        if self.channels.iter().any(|(n, _)| n == name) {
            return Err(Error::channel(format!("duplicate channel name '{name}'")));
        }
        let channel = Rc::new(RefCell::new(Channel::new(kind, name, protocol, config)?));
        let managed: Rc<RefCell<dyn ManagedChannel>> = channel.clone();
        self.channels.push((name.to_string(), managed));
        self.refresh_pollout();
        Ok(channel)
    }

    /// Channel registered under `name`, as the manager-facing view.
    pub fn channel(&self, name: &str) -> Option<Rc<RefCell<dyn ManagedChannel>>> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, chn)| chn.clone())
    }

    /// Names of all registered channels, in creation order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true when no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Create and set up ZMQ sockets for all channels that do not have
    /// one yet.
    pub fn warm_up(&mut self) -> Result<()> {
        for (_, chn) in &self.channels {
            chn.borrow_mut().warm_up(&self.ctx)?;
        }
        Ok(())
    }

    /// Returns true if [`wait`](Self::wait) will check for OUT events
    /// on any channel.
    pub fn has_pollout(&self) -> bool {
        self.has_pollout
    }

    /// Recompute the cached OUT-interest flag from the channels'
    /// current `wait_for` registrations.
    pub fn refresh_pollout(&mut self) {
        self.has_pollout = self
            .channels
            .iter()
            .any(|(_, chn)| chn.borrow().wait_for().contains(Direction::OUT));
    }

    /// Wait for I/O events on channels.
    ///
    /// The poll set is assembled from all channels with a non-empty
    /// `wait_for` and an existing socket. Returns the observed
    /// direction per channel name; an empty result means the timeout
    /// expired.
    ///
    /// # Errors
    ///
    /// Propagates poll failures from the ZMQ layer.
    pub fn wait(&mut self, timeout_ms: Option<i64>) -> Result<Vec<(String, Direction)>> {
        self.refresh_pollout();
        let mut polled: Vec<(&str, std::cell::Ref<'_, dyn ManagedChannel>)> = Vec::new();
        for (name, chn) in &self.channels {
            let guard = chn.borrow();
            if !guard.wait_for().is_empty() && guard.socket().is_some() {
                polled.push((name.as_str(), guard));
            }
        }
        if polled.is_empty() {
            return Ok(Vec::new());
        }
        let mut items: Vec<zmq::PollItem<'_>> = polled
            .iter()
            .map(|(_, guard)| {
                guard
                    .socket()
                    .expect("polled channel has socket")
                    .as_poll_item(guard.wait_for().to_poll_events())
            })
            .collect();
        match zmq::poll(&mut items, timeout_ms.unwrap_or(-1)) {
            Ok(_) => {}
            // An interrupt during the wait reads as an empty result;
            // the caller's loop re-enters and observes its stop signal.
            Err(zmq::Error::EINTR) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }
        let mut events = Vec::new();
        for ((name, _), item) in polled.iter().zip(items.iter()) {
            let dir = Direction::from_poll_events(item.get_revents());
            if !dir.is_empty() {
                events.push(((*name).to_string(), dir));
            }
        }
        Ok(events)
    }

    /// Close all managed channels.
    ///
    /// Unbinds or disconnects active channels (errors are swallowed),
    /// clears their sessions, and closes the sockets respecting
    /// linger, or drops them with linger 0 when `forced`.
    /// Deterministic and idempotent.
    pub fn shutdown(&mut self, forced: bool) {
        for (name, chn) in &self.channels {
            tracing::debug!(channel = name.as_str(), forced, "channel shutdown");
            chn.borrow_mut().shutdown(forced);
        }
        self.has_pollout = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SimpleMessage;
    use crate::protocol::{DispatchKey, HandlerMap};
    use crate::session::{SessionBase, SessionStore};
    use crate::types::{Received, RoutingId};
    use crate::channel::ChannelCore;

    struct SinkProtocol {
        handlers: HandlerMap<SinkProtocol>,
    }

    impl SinkProtocol {
        fn new() -> Self {
            let mut handlers = HandlerMap::new();
            handlers.set(DispatchKey::Any, Self::on_any as _);
            Self { handlers }
        }

        fn on_any(
            _proto: &mut Self,
            _chn: &mut ChannelCore,
            _sessions: &mut SessionStore<SessionBase>,
            _rid: &RoutingId,
            msg: &SimpleMessage,
        ) -> crate::error::Result<Option<SimpleMessage>> {
            Ok(Some(msg.clone()))
        }
    }

    impl Protocol for SinkProtocol {
        type Session = SessionBase;
        type Message = SimpleMessage;

        fn handlers(&self) -> &HandlerMap<Self> {
            &self.handlers
        }
    }

    #[test]
    fn test_duplicate_channel_name_rejected() {
        let mut mngr = ChannelManager::new(zmq::Context::new());
        mngr.create_channel(
            SocketKind::Pair,
            "ctrl",
            SinkProtocol::new(),
            ChannelConfig::default(),
        )
        .unwrap();
        let dup = mngr.create_channel(
            SocketKind::Pair,
            "ctrl",
            SinkProtocol::new(),
            ChannelConfig::default(),
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_warm_up_creates_sockets_once() {
        let mut mngr = ChannelManager::new(zmq::Context::new());
        let chn = mngr
            .create_channel(
                SocketKind::Pair,
                "warm",
                SinkProtocol::new(),
                ChannelConfig::default(),
            )
            .unwrap();
        assert!(chn.borrow().core().socket().is_none());
        mngr.warm_up().unwrap();
        assert!(chn.borrow().core().socket().is_some());
        // idempotent
        mngr.warm_up().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_empty() {
        let mut mngr = ChannelManager::new(zmq::Context::new());
        let chn = mngr
            .create_channel(
                SocketKind::Pull,
                "in",
                SinkProtocol::new(),
                ChannelConfig::wait_for(Direction::IN),
            )
            .unwrap();
        mngr.warm_up().unwrap();
        chn.borrow_mut().bind(&"inproc://mngr-wait".parse().unwrap()).unwrap();
        let events = mngr.wait(Some(10)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_wait_reports_input() {
        let ctx = zmq::Context::new();
        let mut mngr = ChannelManager::new(ctx.clone());
        let pull = mngr
            .create_channel(
                SocketKind::Pull,
                "sink",
                SinkProtocol::new(),
                ChannelConfig::wait_for(Direction::IN),
            )
            .unwrap();
        let push = mngr
            .create_channel(
                SocketKind::Push,
                "feed",
                SinkProtocol::new(),
                ChannelConfig::default(),
            )
            .unwrap();
        mngr.warm_up().unwrap();
        let addr = pull.borrow_mut().bind(&"inproc://mngr-in".parse().unwrap()).unwrap();
        push.borrow_mut().connect(&addr, None).unwrap();
        push.borrow_mut()
            .send(&SimpleMessage::from_frame(&b"x"[..]), &RoutingId::internal())
            .unwrap();

        let events = mngr.wait(Some(1000)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "sink");
        assert!(events[0].1.contains(Direction::IN));

        let received = pull.borrow_mut().receive(None).unwrap();
        assert!(matches!(received, Received::Message(_)));
    }

    #[test]
    fn test_has_pollout_cache() {
        let ctx = zmq::Context::new();
        let mut mngr = ChannelManager::new(ctx);
        assert!(!mngr.has_pollout());
        let _chn = mngr
            .create_channel(
                SocketKind::Push,
                "out",
                SinkProtocol::new(),
                ChannelConfig::wait_for(Direction::OUT),
            )
            .unwrap();
        assert!(mngr.has_pollout());
    }

    #[test]
    fn test_shutdown_idempotent() {
        let ctx = zmq::Context::new();
        let mut mngr = ChannelManager::new(ctx);
        let chn = mngr
            .create_channel(
                SocketKind::Pair,
                "down",
                SinkProtocol::new(),
                ChannelConfig::default(),
            )
            .unwrap();
        mngr.warm_up().unwrap();
        chn.borrow_mut().bind(&"inproc://mngr-down".parse().unwrap()).unwrap();
        mngr.shutdown(false);
        assert!(chn.borrow().core().socket().is_none());
        assert!(chn.borrow().sessions().is_empty());
        // second shutdown is a no-op
        mngr.shutdown(true);
    }
}
