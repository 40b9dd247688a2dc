//! VRRP node state machine.
//!
//! A [`Node`] is one member of a two-node high availability cluster. It
//! starts as BACKUP, becomes MASTER when the peer falls silent for the
//! RFC 5798 master-down interval (or releases mastership, or loses a
//! priority comparison), and reports every transition to the engine.
//!
//! The run loop is the only writer of state. Around it, background tasks
//! feed it through bounded channels: a receiver pulling validated
//! advertisements off the transport, a sender emitting advertisements while
//! MASTER, a status reporter and a config checker talking to the engine.
//! Fatal conditions from any task arrive on the error channel and end the
//! run loop; a task that cannot even post its error aborts the process,
//! since a supervisory layer must never fail silently.

use crate::advertisement::{Advertisement, VRRP_VERSION_TYPE};
use crate::conn::HAConn;
use crate::engine::Engine;
use crate::types::{master_down_interval, HAState, HAStatus, NodeConfig};
use common::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the advertisement receive queue.
const RECV_QUEUE_LEN: usize = 20;

/// Grace period allowing the final priority-0 advertisement to go out
/// before the SHUTDOWN transition completes.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// State record guarded by the status lock.
struct StatusRecord {
    state: HAState,
    since: SystemTime,
    transitions: u64,
}

/// Receiver halves consumed by the run loop.
struct RunChannels {
    recv_rx: mpsc::Receiver<Advertisement>,
    err_rx: mpsc::Receiver<Error>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Timer state owned exclusively by the run loop.
struct RunState {
    master_down_interval: Duration,
    last_master_advert_time: Instant,
}

impl RunState {
    fn new(config: &NodeConfig) -> Self {
        Self {
            master_down_interval: master_down_interval(
                config.ha.priority,
                config.master_advert_interval,
            ),
            last_master_advert_time: Instant::now(),
        }
    }

    /// Recompute the master-down interval when the observed advertisement
    /// interval changes.
    fn reset_master_down_interval(&mut self, priority: u8, advert_interval: Duration) {
        let interval = master_down_interval(priority, advert_interval);
        if interval != self.master_down_interval {
            self.master_down_interval = interval;
            debug!(
                master_down_ms = interval.as_millis() as u64,
                "reset master down interval"
            );
        }
    }
}

/// One member of a high availability cluster.
pub struct Node {
    config: NodeConfig,
    conn: Arc<dyn HAConn>,
    engine: Arc<dyn Engine>,
    status: RwLock<StatusRecord>,
    sent: AtomicU64,
    received: AtomicU64,
    recv_tx: mpsc::Sender<Advertisement>,
    err_tx: mpsc::Sender<Error>,
    shutdown_tx: mpsc::Sender<()>,
    stop_sender_tx: mpsc::Sender<HAState>,
    stop_sender_rx: AsyncMutex<mpsc::Receiver<HAState>>,
    run_channels: AsyncMutex<Option<RunChannels>>,
}

impl Node {
    /// Create a new node in BACKUP state. `run` must be called for it to
    /// participate in the cluster.
    pub fn new(config: NodeConfig, conn: Arc<dyn HAConn>, engine: Arc<dyn Engine>) -> Result<Self> {
        config.validate()?;

        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_LEN);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (stop_sender_tx, stop_sender_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            conn,
            engine,
            status: RwLock::new(StatusRecord {
                state: HAState::Backup,
                since: SystemTime::now(),
                transitions: 0,
            }),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            recv_tx,
            err_tx,
            shutdown_tx,
            stop_sender_tx,
            stop_sender_rx: AsyncMutex::new(stop_sender_rx),
            run_channels: AsyncMutex::new(Some(RunChannels {
                recv_rx,
                err_rx,
                shutdown_rx,
            })),
        })
    }

    /// Current HA state.
    pub async fn state(&self) -> HAState {
        self.status.read().await.state
    }

    async fn set_state(&self, state: HAState) {
        let mut record = self.status.write().await;
        if record.state != state {
            record.state = state;
            record.since = SystemTime::now();
            record.transitions += 1;
        }
    }

    /// Current status snapshot.
    pub async fn status(&self) -> HAStatus {
        // Counters and queue depth are sampled under the same exclusive
        // hold of the status record, so a snapshot is internally
        // consistent with the state it reports.
        let record = self.status.write().await;
        HAStatus {
            state: record.state,
            since: record.since,
            transitions: record.transitions,
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            received_queued: (self.recv_tx.max_capacity() - self.recv_tx.capacity()) as u64,
        }
    }

    /// An advertisement carrying this node's VRID and priority.
    fn new_advertisement(&self) -> Advertisement {
        Advertisement::new(
            self.config.ha.vrid,
            self.config.ha.priority,
            self.config.advert_int_centis(),
        )
    }

    /// Send and receive advertisements, change state in response, and keep
    /// the engine informed, until [`Node::shutdown`] is called or an
    /// unrecoverable error occurs.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut channels = self
            .run_channels
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::node("node is already running"))?;

        info!(
            vrid = self.config.ha.vrid,
            priority = self.config.ha.priority,
            "starting HA node"
        );

        tokio::spawn(Arc::clone(&self).receive_advertisements());
        tokio::spawn(Arc::clone(&self).report_status());
        tokio::spawn(Arc::clone(&self).check_config());

        let mut rs = RunState::new(&self.config);
        while self.state().await != HAState::Shutdown {
            if let Err(e) = Node::run_once(&self, &mut rs, &mut channels).await {
                error!(error = %e, "HA node run loop failed");
                self.set_state(HAState::Error).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Request a graceful shutdown. `run` observes the request, performs
    /// the SHUTDOWN transition and returns.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send(()).await.is_err() {
            warn!("shutdown requested but the run loop is gone");
        }
    }

    async fn run_once(
        node: &Arc<Node>,
        rs: &mut RunState,
        channels: &mut RunChannels,
    ) -> Result<()> {
        let current = node.state().await;
        let new_state = match current {
            HAState::Backup => node.backup_tasks(rs, channels).await?,
            HAState::Master => node.master_tasks(rs, channels).await?,
            state => return Err(Error::node(format!("invalid state {state}"))),
        };

        match (current, new_state) {
            (HAState::Backup, HAState::Backup) | (HAState::Master, HAState::Master) => {}
            (HAState::Backup, HAState::Master) => Node::become_master(node).await,
            (HAState::Master, HAState::Backup) => node.become_backup().await,
            (_, HAState::Shutdown) => node.become_shutdown().await,
            (from, to) => {
                return Err(Error::node(format!(
                    "can't handle transition from {from} to {to}"
                )));
            }
        }
        Ok(())
    }

    /// Wait in BACKUP for one of: a queued advertisement, a shutdown
    /// request, a fatal error, or expiry of the master-down timer.
    async fn backup_tasks(
        &self,
        rs: &mut RunState,
        channels: &mut RunChannels,
    ) -> Result<HAState> {
        let deadline = rs.last_master_advert_time + rs.master_down_interval;
        tokio::select! {
            advert = channels.recv_rx.recv() => match advert {
                Some(advert) => Ok(self.backup_handle_advertisement(rs, &advert)),
                None => Err(Error::node("receive queue closed")),
            },
            _ = channels.shutdown_rx.recv() => Ok(HAState::Shutdown),
            err = channels.err_rx.recv() => {
                Err(err.unwrap_or_else(|| Error::node("error channel closed")))
            }
            _ = time::sleep_until(deadline) => {
                info!("timed out waiting for advertisement");
                // An advertisement may have been queued while the timer fired.
                match channels.recv_rx.try_recv() {
                    Ok(advert) => {
                        info!("found advertisement queued for processing");
                        Ok(self.backup_handle_advertisement(rs, &advert))
                    }
                    Err(_) => {
                        info!("becoming MASTER");
                        Ok(HAState::Master)
                    }
                }
            }
        }
    }

    fn backup_handle_advertisement(
        &self,
        rs: &mut RunState,
        advert: &Advertisement,
    ) -> HAState {
        if advert.version_type != VRRP_VERSION_TYPE {
            return HAState::Backup;
        }
        if advert.vrid != self.config.ha.vrid {
            info!(
                peer_vrid = advert.vrid,
                vrid = self.config.ha.vrid,
                "ignoring advertisement for foreign VRID"
            );
            return HAState::Backup;
        }
        if advert.priority == 0 {
            info!("peer is releasing mastership - becoming MASTER");
            return HAState::Master;
        }
        if self.config.preempt && advert.priority < self.config.ha.priority {
            info!(
                peer_priority = advert.priority,
                priority = self.config.ha.priority,
                "peer priority below ours - becoming MASTER"
            );
            return HAState::Master;
        }

        // Per RFC 5798 the master-down interval follows the advertisement
        // interval of the current master. AdvertInt is in centiseconds.
        rs.reset_master_down_interval(
            self.config.ha.priority,
            Duration::from_millis(10 * advert.advert_int as u64),
        );
        rs.last_master_advert_time = Instant::now();
        HAState::Backup
    }

    /// Wait in MASTER for one of: a queued advertisement, a shutdown
    /// request, or a fatal error.
    async fn master_tasks(
        &self,
        rs: &mut RunState,
        channels: &mut RunChannels,
    ) -> Result<HAState> {
        tokio::select! {
            advert = channels.recv_rx.recv() => match advert {
                Some(advert) => Ok(self.master_handle_advertisement(rs, &advert)),
                None => Err(Error::node("receive queue closed")),
            },
            _ = channels.shutdown_rx.recv() => Ok(HAState::Shutdown),
            err = channels.err_rx.recv() => {
                Err(err.unwrap_or_else(|| Error::node("error channel closed")))
            }
        }
    }

    fn master_handle_advertisement(
        &self,
        rs: &mut RunState,
        advert: &Advertisement,
    ) -> HAState {
        if advert.version_type != VRRP_VERSION_TYPE {
            return HAState::Master;
        }
        if advert.vrid != self.config.ha.vrid {
            info!(
                peer_vrid = advert.vrid,
                vrid = self.config.ha.vrid,
                "ignoring advertisement for foreign VRID"
            );
            return HAState::Master;
        }
        if advert.priority == self.config.ha.priority {
            // TODO: compare primary IP addresses to break priority ties per
            // RFC 5798.
            info!(
                peer_priority = advert.priority,
                "ignoring advertisement with our own priority"
            );
            return HAState::Master;
        }
        if advert.priority > self.config.ha.priority {
            info!(
                peer_priority = advert.priority,
                priority = self.config.ha.priority,
                "peer priority above ours - becoming BACKUP"
            );
            rs.last_master_advert_time = Instant::now();
            return HAState::Backup;
        }

        // Lower priority: our own advertisements will preempt the peer.
        HAState::Master
    }

    async fn become_master(node: &Arc<Node>) {
        info!("becoming MASTER");
        if let Err(e) = node.engine.ha_state(HAState::Master).await {
            // The status reporter will re-notify the engine or die trying.
            warn!(error = %e, "failed to notify engine");
        }

        tokio::spawn(Arc::clone(node).send_advertisements());
        node.set_state(HAState::Master).await;
    }

    async fn become_backup(&self) {
        info!("becoming BACKUP");
        if let Err(e) = self.engine.ha_state(HAState::Backup).await {
            // The status reporter will re-notify the engine or die trying.
            warn!(error = %e, "failed to notify engine");
        }

        if self.stop_sender_tx.send(HAState::Backup).await.is_err() {
            warn!("advertisement sender is gone");
        }
        self.set_state(HAState::Backup).await;
    }

    async fn become_shutdown(&self) {
        info!("becoming SHUTDOWN");
        if let Err(e) = self.engine.ha_state(HAState::Shutdown).await {
            warn!(error = %e, "failed to notify engine");
        }

        if self.state().await == HAState::Master {
            if self.stop_sender_tx.send(HAState::Shutdown).await.is_err() {
                warn!("advertisement sender is gone");
            }
            // Give the sender a moment to emit the final advertisement.
            time::sleep(SHUTDOWN_GRACE).await;
        }
        self.set_state(HAState::Shutdown).await;
    }

    /// Emit one advertisement per master advertisement interval until told
    /// to stop. A stop carrying SHUTDOWN sends a final advertisement with
    /// priority 0 so the peer takes over without waiting for its timer.
    async fn send_advertisements(self: Arc<Self>) {
        let mut stop_rx = self.stop_sender_rx.lock().await;
        let mut ticker = time::interval(self.config.master_advert_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let advert = self.new_advertisement();
                    if let Err(e) = self.conn.send(&advert, self.config.master_advert_interval).await {
                        self.post_error(e);
                        continue;
                    }
                    let sent = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(sent, "sent advertisement");
                }
                state = stop_rx.recv() => {
                    if state == Some(HAState::Shutdown) {
                        let mut advert = self.new_advertisement();
                        advert.priority = 0;
                        if let Err(e) = self.conn.send(&advert, Duration::from_secs(1)).await {
                            error!(error = %e, "failed to send shutdown advertisement");
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Pull validated advertisements off the transport and queue them for
    /// the run loop.
    async fn receive_advertisements(self: Arc<Self>) {
        loop {
            match self.conn.receive().await {
                Ok(Some(advert)) => {
                    let received = self.received.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(received, "received advertisement");
                    self.queue_advertisement(advert);
                }
                Ok(None) => {}
                Err(e) => self.post_error(e),
            }
        }
    }

    fn queue_advertisement(&self, advert: Advertisement) {
        let queued = (self.recv_tx.max_capacity() - self.recv_tx.capacity()) as u64;
        if queued > 0 {
            info!(queued, "advertisements already queued");
        }
        if self.recv_tx.try_send(advert).is_err() {
            self.post_error(Error::QueueOverflow);
        }
    }

    /// Periodically report the status snapshot to the engine and honor its
    /// failover requests. Failure past the retry budget is fatal.
    async fn report_status(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.status_report_interval);
        ticker.tick().await; // Skip first immediate tick
        loop {
            ticker.tick().await;

            let mut failures: u32 = 0;
            let failover = loop {
                match self.engine.ha_update(self.status().await).await {
                    Ok(failover) => break failover,
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "status report failed");
                        if failures > self.config.status_report_max_failures {
                            self.post_error(Error::engine(format!(
                                "status report: {failures} errors, giving up"
                            )));
                            return;
                        }
                        time::sleep(self.config.status_report_retry_delay).await;
                    }
                }
            };

            if failover && self.state().await == HAState::Master {
                info!("received failover request, initiating shutdown");
                self.shutdown().await;
            }
        }
    }

    /// Periodically compare the engine's HA configuration with the running
    /// one. Drift is fatal so a supervisor can restart the node with the
    /// new parameters.
    async fn check_config(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.config_check_interval);
        ticker.tick().await; // Skip first immediate tick
        loop {
            ticker.tick().await;

            let mut failures: u32 = 0;
            let config = loop {
                match self.engine.ha_config().await {
                    Ok(config) => break config,
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "config check failed");
                        if failures > self.config.config_check_max_failures {
                            self.post_error(Error::engine(format!(
                                "config check: {failures} errors, giving up"
                            )));
                            return;
                        }
                        time::sleep(self.config.config_check_retry_delay).await;
                    }
                }
            };

            if config != self.config.ha {
                info!(new_config = ?config, "HA configuration has changed");
                self.post_error(Error::config("HA configuration has changed"));
            }
        }
    }

    /// Post a fatal error to the run loop. A supervisory task that cannot
    /// be heard aborts the process rather than failing silently.
    fn post_error(&self, err: Error) {
        if let Err(send_err) = self.err_tx.try_send(err) {
            error!(error = %send_err.into_inner(), "unable to post to error channel, aborting");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HAConfig;
    use async_trait::async_trait;
    use std::future;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::{sleep, timeout};

    struct TestConn {
        inbound: AsyncMutex<mpsc::Receiver<Advertisement>>,
        outbound: UnboundedSender<Advertisement>,
    }

    #[async_trait]
    impl HAConn for TestConn {
        async fn send(&self, advert: &Advertisement, _timeout: Duration) -> Result<()> {
            let _ = self.outbound.send(*advert);
            Ok(())
        }

        async fn receive(&self) -> Result<Option<Advertisement>> {
            match self.inbound.lock().await.recv().await {
                Some(advert) => Ok(Some(advert)),
                None => future::pending().await,
            }
        }
    }

    fn test_conn() -> (
        Arc<TestConn>,
        mpsc::Sender<Advertisement>,
        UnboundedReceiver<Advertisement>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(TestConn {
            inbound: AsyncMutex::new(in_rx),
            outbound: out_tx,
        });
        (conn, in_tx, out_rx)
    }

    struct TestEngine {
        states: StdMutex<Vec<HAState>>,
        config: StdMutex<HAConfig>,
        failover: AtomicBool,
        fail_updates: AtomicBool,
    }

    impl TestEngine {
        fn new(config: HAConfig) -> Arc<Self> {
            Arc::new(Self {
                states: StdMutex::new(Vec::new()),
                config: StdMutex::new(config),
                failover: AtomicBool::new(false),
                fail_updates: AtomicBool::new(false),
            })
        }

        fn states(&self) -> Vec<HAState> {
            self.states.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Engine for TestEngine {
        async fn ha_state(&self, state: HAState) -> Result<()> {
            self.states.lock().unwrap().push(state);
            Ok(())
        }

        async fn ha_update(&self, _status: HAStatus) -> Result<bool> {
            if self.fail_updates.load(Ordering::Relaxed) {
                return Err(Error::engine("engine unavailable"));
            }
            Ok(self.failover.load(Ordering::Relaxed))
        }

        async fn ha_config(&self) -> Result<HAConfig> {
            Ok(self.config.lock().unwrap().clone())
        }
    }

    fn test_ha_config(priority: u8) -> HAConfig {
        HAConfig {
            enabled: true,
            local_addr: "10.0.0.1".parse().unwrap(),
            remote_addr: "10.0.0.2".parse().unwrap(),
            priority,
            vrid: 60,
        }
    }

    /// 50ms advertisement interval keeps the master-down timer under 200ms.
    fn test_node_config(priority: u8) -> NodeConfig {
        NodeConfig {
            ha: test_ha_config(priority),
            master_advert_interval: Duration::from_millis(50),
            preempt: true,
            config_check_interval: Duration::from_secs(60),
            config_check_max_failures: 3,
            config_check_retry_delay: Duration::from_millis(10),
            status_report_interval: Duration::from_secs(60),
            status_report_max_failures: 3,
            status_report_retry_delay: Duration::from_millis(10),
        }
    }

    fn advert(vrid: u8, priority: u8, advert_int: u16) -> Advertisement {
        Advertisement::new(vrid, priority, advert_int)
    }

    async fn join_run(
        handle: tokio::task::JoinHandle<Result<()>>,
    ) -> Result<()> {
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("run loop did not finish in time")
            .expect("run task panicked")
    }

    #[tokio::test]
    async fn test_backup_becomes_master_on_peer_silence() {
        let (conn, _in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Arc::new(Node::new(test_node_config(100), conn, Arc::clone(&engine) as Arc<dyn Engine>).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        // master_down_interval(100, 50ms) is just over 180ms.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(node.state().await, HAState::Backup);

        sleep(Duration::from_millis(400)).await;
        assert_eq!(node.state().await, HAState::Master);
        assert!(engine.states().contains(&HAState::Master));

        let status = node.status().await;
        assert_eq!(status.state, HAState::Master);
        assert!(status.transitions >= 1);
        assert!(status.sent >= 1, "master should have sent advertisements");

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
        assert_eq!(node.state().await, HAState::Shutdown);
    }

    #[tokio::test]
    async fn test_advertisement_resets_master_down_timer() {
        let (conn, in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Arc::new(Node::new(test_node_config(100), conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        // A higher-priority master advertising at 1s pushes the master-down
        // timer out to ~3.6s.
        in_tx.send(advert(60, 200, 100)).await.unwrap();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(node.state().await, HAState::Backup);

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_preempt_takes_over_lower_priority_master() {
        let (conn, in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(150));
        let node = Arc::new(Node::new(test_node_config(150), conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        in_tx.send(advert(60, 100, 100)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(node.state().await, HAState::Master);

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_preempt_stays_backup() {
        let (conn, in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(150));
        let mut config = test_node_config(150);
        config.preempt = false;
        let node = Arc::new(Node::new(config, conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        // A lower-priority master advertising at 1s keeps us BACKUP when
        // preemption is off.
        in_tx.send(advert(60, 100, 100)).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(node.state().await, HAState::Backup);

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_priority_zero_triggers_immediate_takeover() {
        let (conn, in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Arc::new(Node::new(test_node_config(100), conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        // Establish a master advertising at 1s; its master-down interval is
        // ~3.6s, far beyond this test.
        in_tx.send(advert(60, 200, 100)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(node.state().await, HAState::Backup);

        // The master releases; takeover must not wait for the timer.
        in_tx.send(advert(60, 0, 100)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(node.state().await, HAState::Master);

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_vrid_is_ignored() {
        let (conn, in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Arc::new(Node::new(test_node_config(100), conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        // Advertisements for another VRID must not reset our timer.
        in_tx.send(advert(61, 200, 100)).await.unwrap();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(node.state().await, HAState::Master);

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_master_yields_to_higher_priority() {
        let (conn, in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Arc::new(Node::new(test_node_config(100), conn, Arc::clone(&engine) as Arc<dyn Engine>).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        sleep(Duration::from_millis(400)).await;
        assert_eq!(node.state().await, HAState::Master);

        in_tx.send(advert(60, 150, 100)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(node.state().await, HAState::Backup);

        let states = engine.states();
        assert!(states.contains(&HAState::Master));
        assert_eq!(states.last(), Some(&HAState::Backup));

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_master_ignores_lower_and_equal_priority() {
        let (conn, in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Arc::new(Node::new(test_node_config(100), conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        sleep(Duration::from_millis(400)).await;
        assert_eq!(node.state().await, HAState::Master);

        // Lower priority: our advertisements will preempt the peer.
        in_tx.send(advert(60, 50, 100)).await.unwrap();
        // Equal priority: ties are not broken, the advertisement is ignored.
        in_tx.send(advert(60, 100, 100)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(node.state().await, HAState::Master);

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_sends_priority_zero() {
        let (conn, _in_tx, mut out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(150));
        let node = Arc::new(Node::new(test_node_config(150), conn, Arc::clone(&engine) as Arc<dyn Engine>).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        sleep(Duration::from_millis(400)).await;
        assert_eq!(node.state().await, HAState::Master);

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
        assert_eq!(node.state().await, HAState::Shutdown);
        assert_eq!(engine.states().last(), Some(&HAState::Shutdown));

        let mut sent = Vec::new();
        while let Ok(advert) = out_rx.try_recv() {
            sent.push(advert);
        }
        assert!(!sent.is_empty());
        let last = sent.last().unwrap();
        assert_eq!(last.priority, 0, "final advertisement must release mastership");
        assert!(sent[..sent.len() - 1].iter().all(|a| a.priority == 150));
    }

    #[tokio::test]
    async fn test_failover_request_shuts_down_master() {
        let (conn, _in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(150));
        let mut config = test_node_config(150);
        config.status_report_interval = Duration::from_millis(100);
        let node = Arc::new(Node::new(config, conn, Arc::clone(&engine) as Arc<dyn Engine>).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        sleep(Duration::from_millis(400)).await;
        assert_eq!(node.state().await, HAState::Master);

        engine.failover.store(true, Ordering::Relaxed);
        assert!(join_run(handle).await.is_ok());
        assert_eq!(node.state().await, HAState::Shutdown);
    }

    #[tokio::test]
    async fn test_status_report_failures_are_fatal() {
        let (conn, _in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        engine.fail_updates.store(true, Ordering::Relaxed);
        let mut config = test_node_config(100);
        config.status_report_interval = Duration::from_millis(50);
        config.status_report_max_failures = 2;
        let node = Arc::new(Node::new(config, conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        let err = join_run(handle).await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
        assert_eq!(node.state().await, HAState::Error);
    }

    #[tokio::test]
    async fn test_config_drift_is_fatal() {
        let (conn, _in_tx, _out_rx) = test_conn();
        // The engine hands out a different priority than we are running with.
        let engine = TestEngine::new(test_ha_config(101));
        let mut config = test_node_config(100);
        config.config_check_interval = Duration::from_millis(100);
        let node = Arc::new(Node::new(config, conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());

        let err = join_run(handle).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(node.state().await, HAState::Error);
    }

    #[tokio::test]
    async fn test_receive_queue_overflow_is_fatal() {
        let (conn, _in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Node::new(test_node_config(100), conn, engine).unwrap();

        let queued = advert(60, 200, 100);
        for _ in 0..RECV_QUEUE_LEN {
            node.queue_advertisement(queued);
        }
        // The queue holds 20 advertisements; the 21st is fatal.
        node.queue_advertisement(queued);

        let mut channels = node.run_channels.lock().await.take().unwrap();
        let err = channels.err_rx.recv().await.unwrap();
        assert!(matches!(err, Error::QueueOverflow));
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let (conn, _in_tx, _out_rx) = test_conn();
        let engine = TestEngine::new(test_ha_config(100));
        let node = Arc::new(Node::new(test_node_config(100), conn, engine).unwrap());

        let handle = tokio::spawn(Arc::clone(&node).run());
        sleep(Duration::from_millis(50)).await;

        let err = Arc::clone(&node).run().await.unwrap_err();
        assert!(matches!(err, Error::Node(_)));

        node.shutdown().await;
        assert!(join_run(handle).await.is_ok());
    }
}
