//! Shared wiring for integration tests: a LocalNode with a multiplexer, an
//! application client and (optionally) a heartbeat manager.
#![allow(dead_code)]

use std::sync::Arc;

use mesh_protocol::{
    ClientRun, HeartbeatManager, MessageMultiplexer, MuxClient, MuxRun, Tag, HEARTBEAT_TAG,
};
use mesh_transport::bytes::Bytes;
use mesh_transport::{
    LocalNetwork, LocalNode, MeshConfig, MessageHandler, NodeRun, PeerId, ProtocolError,
};
use tokio::sync::mpsc;

pub const APP_TAG: Tag = 1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Forwards every payload to a channel.
pub struct Recorder(mpsc::UnboundedSender<(PeerId, Bytes)>);

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(PeerId, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self(tx)), rx)
    }
}

impl MessageHandler for Recorder {
    fn on_message(&self, source: PeerId, payload: &mut Bytes) -> Result<(), ProtocolError> {
        let body = std::mem::take(payload);
        let _ = self.0.send((source, body));
        Ok(())
    }
}

/// Accepts and discards everything.
pub struct Ignore;

impl MessageHandler for Ignore {
    fn on_message(&self, _source: PeerId, payload: &mut Bytes) -> Result<(), ProtocolError> {
        payload.clear();
        Ok(())
    }
}

/// A fully wired node. Fields drop in declaration order, which is the
/// teardown order the multiplexer requires.
pub struct MeshNode {
    _node_run: NodeRun,
    _mux_run: MuxRun,
    _client_runs: Vec<ClientRun>,
    pub heartbeat: Option<HeartbeatManager>,
    pub app: Arc<MuxClient>,
    _heartbeat_client: Arc<MuxClient>,
    pub mux: MessageMultiplexer,
    pub node: Arc<LocalNode>,
}

impl MeshNode {
    /// Node that runs a heartbeat manager.
    pub fn live(network: &LocalNetwork, config: &MeshConfig, app: Arc<dyn MessageHandler>) -> Self {
        Self::build(network, config, app, true)
    }

    /// Node that understands the heartbeat tag but never sends keepalives.
    pub fn silent(
        network: &LocalNetwork,
        config: &MeshConfig,
        app: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::build(network, config, app, false)
    }

    pub fn id(&self) -> PeerId {
        self.node.id()
    }

    pub fn heartbeat(&self) -> &HeartbeatManager {
        self.heartbeat.as_ref().expect("node has no heartbeat manager")
    }

    fn build(
        network: &LocalNetwork,
        config: &MeshConfig,
        app_handler: Arc<dyn MessageHandler>,
        with_heartbeat: bool,
    ) -> Self {
        let node = LocalNode::bind(network, config.clone()).unwrap();
        let mux = MessageMultiplexer::from_config(node.clone(), config).unwrap();
        let heartbeat_client = Arc::new(mux.client(HEARTBEAT_TAG));
        let app = Arc::new(mux.client(APP_TAG));

        let mut client_runs = vec![app.run(app_handler)];
        let heartbeat = if with_heartbeat {
            let hb =
                HeartbeatManager::spawn(heartbeat_client.clone(), node.clone(), config).unwrap();
            client_runs.push(heartbeat_client.run(hb.handler()));
            Some(hb)
        } else {
            client_runs.push(heartbeat_client.run(Arc::new(Ignore)));
            None
        };

        let mux_run = mux.run();
        let inbound = match &heartbeat {
            Some(hb) => hb.observe(mux_run.handler()),
            None => mux_run.handler(),
        };
        let node_run = node.run(inbound);

        Self {
            _node_run: node_run,
            _mux_run: mux_run,
            _client_runs: client_runs,
            heartbeat,
            app,
            _heartbeat_client: heartbeat_client,
            mux,
            node,
        }
    }
}
