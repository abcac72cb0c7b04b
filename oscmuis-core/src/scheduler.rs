//! The periodic loop that owns reconciliation and test dispatch.

use crate::network::NetworkModeController;
use crate::osc::{DispatchReport, OscDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub struct Scheduler {
    controller: Arc<NetworkModeController>,
    dispatcher: Arc<OscDispatcher>,
    tick: Duration,
    test_trigger_id: u32,
}

impl Scheduler {
    pub fn new(
        controller: Arc<NetworkModeController>,
        dispatcher: Arc<OscDispatcher>,
        tick: Duration,
        test_trigger_id: u32,
    ) -> Self {
        Self {
            controller,
            dispatcher,
            tick,
            test_trigger_id,
        }
    }

    /// One pass: advance the network state, then serve a pending test trigger.
    pub async fn tick_once(&self) -> Option<DispatchReport> {
        self.controller.reconcile().await;

        if self.dispatcher.check_and_clear_test_request() {
            tracing::info!("Sending OSC test trigger {}", self.test_trigger_id);
            return Some(self.dispatcher.dispatch(self.test_trigger_id).await);
        }
        None
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("⏱️ Scheduler running every {:?}", self.tick);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{MockBackend, MockNetwork};
    use crate::config::{ApConfig, ConnectPolicy};
    use crate::network::{ConnectOutcome, NetworkMode};
    use crate::settings::MemoryStore;
    use crate::traits::DatagramSink;
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink(StdMutex<Vec<SocketAddr>>);

    #[async_trait]
    impl DatagramSink for RecordingSink {
        async fn send_to(&self, payload: &[u8], target: SocketAddr) -> std::io::Result<usize> {
            self.0.lock().unwrap().push(target);
            Ok(payload.len())
        }
    }

    fn setup() -> (Scheduler, Arc<NetworkModeController>, Arc<OscDispatcher>, Arc<RecordingSink>) {
        let radio = Arc::new(MockBackend::with_networks(vec![MockNetwork::secured(
            "Studio",
            "studio-pass",
            -50,
            Ipv4Addr::new(10, 0, 0, 8),
        )
        .with_join_polls(2)]));
        let store = Arc::new(MemoryStore::new());
        let ap = ApConfig {
            ssid: "OSC-Muis".into(),
            password: String::new(),
            channel: 6,
            country_code: "NL".into(),
            interface: "wlan0".into(),
        };
        let policy = ConnectPolicy {
            poll_interval: Duration::ZERO,
            max_attempts: 20,
        };
        let controller = Arc::new(NetworkModeController::new(radio, store.clone(), ap, policy));
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Arc::new(OscDispatcher::new(store, controller.clone(), sink.clone()));
        let scheduler = Scheduler::new(
            controller.clone(),
            dispatcher.clone(),
            Duration::from_millis(50),
            1,
        );
        (scheduler, controller, dispatcher, sink)
    }

    #[tokio::test]
    async fn idle_tick_sends_nothing() {
        let (scheduler, controller, _, sink) = setup();
        controller.start_access_point().await;
        assert!(scheduler.tick_once().await.is_none());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_is_sent_on_next_tick_only() {
        let (scheduler, controller, dispatcher, sink) = setup();
        controller.start_access_point().await;
        dispatcher.request_test(1).await;

        let report = scheduler.tick_once().await.unwrap();
        assert_eq!(report.address, "/kmpush1");
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert!(scheduler.tick_once().await.is_none());
    }

    #[tokio::test]
    async fn ticks_drive_a_connection_attempt() {
        let (scheduler, controller, dispatcher, sink) = setup();
        controller.start_access_point().await;
        let ticket = controller.connect("Studio", "studio-pass").await;

        for _ in 0..10 {
            scheduler.tick_once().await;
        }
        assert_eq!(controller.mode().await, NetworkMode::ApPlusStaConnected);
        assert!(matches!(ticket.outcome().await, ConnectOutcome::Connected { .. }));

        dispatcher.request_test(1).await;
        scheduler.tick_once().await;
        let sent = sink.0.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                "10.0.0.255:8001".parse::<SocketAddr>().unwrap(),
                "192.168.4.255:8001".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (scheduler, _, _, _) = setup();
        let (tx, rx) = watch::channel(false);
        let handle = scheduler.spawn(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
