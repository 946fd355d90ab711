/////////
/// Background geolocation: wait for the network, look up coordinates once,
/// hand them to whoever asks.
////////
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::geolocation::{Coordinates, GeoLookup, HttpGeoLookup};
use crate::network::{probe_from_config, ConnectivityProbe};

/// Owner side of one background lookup.
///
/// The worker thread is the only producer of the capacity-1 result channel
/// and sends at most once. Dropping the resolver requests cancellation but
/// never waits for the worker.
pub struct GeoResolver {
    result_rx: Option<Receiver<Coordinates>>,
    // Dropping the sender is the stop signal
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl GeoResolver {
    /// Spawns the worker and returns immediately.
    pub fn start<P, L>(probe: P, lookup: L, poll_interval: Duration) -> Self
    where
        P: ConnectivityProbe + 'static,
        L: GeoLookup + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);
        let spawned = thread::Builder::new()
            .name("geo-resolver".to_string())
            .spawn(move || run_worker(probe, lookup, poll_interval, stop_rx, result_tx));
        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Sender went down with the closure; readers see absence
                warn!("can't spawn geolocation thread: {err}");
                None
            }
        };
        Self {
            result_rx: Some(result_rx),
            stop_tx: Some(stop_tx),
            handle,
            poll_interval,
        }
    }

    /// Starts a resolver using the configured probe and HTTP endpoint.
    pub fn start_from_config(config: &Config) -> Self {
        let probe = probe_from_config(&config.network_manager);
        let lookup = HttpGeoLookup::from_config(&config.geolocation);
        debug!(url = lookup.url(), "starting geolocation resolver");
        Self::start(probe, lookup, config.geolocation.poll_interval())
    }

    /// Requests cancellation. Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.stop_tx.take().is_some() {
            debug!("stopping geolocation thread");
        }
    }

    /// Waits up to `timeout` for the coordinates.
    ///
    /// `None` means "no answer": the lookup failed, was cancelled, or is still
    /// pending. A pending lookup can be asked again later; once a value has
    /// been taken or the worker has finished, every later read is `None`.
    pub fn try_take_result(&mut self, timeout: Duration) -> Option<Coordinates> {
        let rx = self.result_rx.as_ref()?;
        match rx.recv_timeout(timeout) {
            Ok(coords) => {
                self.result_rx = None;
                Some(coords)
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!("can't autodetect timezone coordinates (timed out)");
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("can't autodetect timezone coordinates");
                self.result_rx = None;
                None
            }
        }
    }

    /// Non-blocking variant of [`try_take_result`](Self::try_take_result),
    /// for event loops that check on a timer.
    pub fn poll_result(&mut self) -> Option<Coordinates> {
        let rx = self.result_rx.as_ref()?;
        match rx.try_recv() {
            Ok(coords) => {
                self.result_rx = None;
                Some(coords)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.result_rx = None;
                None
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// True once the worker thread has exited (or was never spawned).
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }
}

impl Drop for GeoResolver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<P, L>(
    mut probe: P,
    mut lookup: L,
    poll_interval: Duration,
    stop_rx: Receiver<()>,
    result_tx: Sender<Coordinates>,
) where
    P: ConnectivityProbe,
    L: GeoLookup,
{
    // Wait until there is an Internet connection available
    loop {
        if stop_requested(&stop_rx) {
            debug!("geolocation cancelled before lookup");
            return;
        }
        match probe.connectivity() {
            Ok(state) if state.is_connected_global() => break,
            Ok(state) => debug!(?state, "waiting for network"),
            Err(err) => debug!("can't get network status: {err:#}"),
        }
        match stop_rx.recv_timeout(poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("geolocation cancelled while waiting for network");
                return;
            }
        }
    }

    match lookup.lookup() {
        Ok(coords) => {
            info!(%coords, "autodetected coordinates");
            // Capacity 1 and a single send: this can't be full
            if result_tx.try_send(coords).is_err() {
                debug!("coordinates receiver already gone");
            }
        }
        Err(err) => warn!("geolocation lookup failed: {err}"),
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    matches!(
        stop_rx.try_recv(),
        Ok(()) | Err(TryRecvError::Disconnected)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geolocation::LookupError;
    use crate::network::{Connectivity, StaticProbe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    const FAST_POLL: Duration = Duration::from_millis(20);

    struct FixedLookup {
        body: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl FixedLookup {
        fn new(body: &'static str) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    body,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl GeoLookup for FixedLookup {
        fn lookup(&mut self) -> Result<Coordinates, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.body.parse()
        }
    }

    // Fails with an error `errors` times, then reports `after`
    struct FlakyProbe {
        errors: usize,
        after: Connectivity,
        calls: Arc<AtomicUsize>,
    }

    impl ConnectivityProbe for FlakyProbe {
        fn connectivity(&mut self) -> anyhow::Result<Connectivity> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.errors {
                anyhow::bail!("org.freedesktop.DBus.Error.ServiceUnknown");
            }
            Ok(self.after)
        }
    }

    fn wait_until_finished(resolver: &GeoResolver, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if resolver.is_finished() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        resolver.is_finished()
    }

    #[test]
    fn delivers_parsed_coordinates() {
        let (lookup, _) = FixedLookup::new("40.7128 -74.0060");
        let mut resolver =
            GeoResolver::start(StaticProbe(Connectivity::ConnectedGlobal), lookup, FAST_POLL);
        assert_eq!(resolver.poll_interval(), FAST_POLL);
        let coords = resolver.try_take_result(Duration::from_secs(5)).unwrap();
        assert_eq!(coords.latitude, 40.7128);
        assert_eq!(coords.longitude, -74.0060);
    }

    #[test]
    fn garbage_body_yields_nothing() {
        let (lookup, calls) = FixedLookup::new("garbage");
        let mut resolver =
            GeoResolver::start(StaticProbe(Connectivity::ConnectedGlobal), lookup, FAST_POLL);
        assert_eq!(resolver.try_take_result(Duration::from_secs(2)), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_connected_yields_nothing_after_timeout() {
        for timeout in [Duration::from_millis(50), Duration::from_millis(200)] {
            let (lookup, calls) = FixedLookup::new("1 2");
            let mut resolver =
                GeoResolver::start(StaticProbe(Connectivity::Other(20)), lookup, FAST_POLL);
            let started = Instant::now();
            assert_eq!(resolver.try_take_result(timeout), None);
            assert!(started.elapsed() >= timeout);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn timeout_is_bounded() {
        let (lookup, _) = FixedLookup::new("1 2");
        let mut resolver = GeoResolver::start(StaticProbe(Connectivity::Unknown), lookup, FAST_POLL);
        let timeout = Duration::from_millis(300);
        let started = Instant::now();
        assert_eq!(resolver.try_take_result(timeout), None);
        assert!(started.elapsed() < timeout + Duration::from_millis(500));
    }

    #[test]
    fn delivers_at_most_once() {
        let (lookup, calls) = FixedLookup::new("10 20");
        let mut resolver =
            GeoResolver::start(StaticProbe(Connectivity::ConnectedGlobal), lookup, FAST_POLL);
        assert!(resolver.try_take_result(Duration::from_secs(5)).is_some());
        assert_eq!(resolver.try_take_result(Duration::from_millis(50)), None);
        assert_eq!(resolver.poll_result(), None);
        assert!(wait_until_finished(&resolver, Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probe_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = FlakyProbe {
            errors: 3,
            after: Connectivity::ConnectedGlobal,
            calls: calls.clone(),
        };
        let (lookup, _) = FixedLookup::new("48.8566 2.3522");
        let mut resolver = GeoResolver::start(probe, lookup, FAST_POLL);
        let coords = resolver.try_take_result(Duration::from_secs(5)).unwrap();
        assert_eq!(coords, Coordinates::new(48.8566, 2.3522).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn stop_ends_polling_within_one_interval() {
        let (lookup, calls) = FixedLookup::new("1 2");
        let interval = Duration::from_secs(1);
        let mut resolver = GeoResolver::start(StaticProbe(Connectivity::Other(20)), lookup, interval);
        thread::sleep(Duration::from_millis(50));
        resolver.stop();
        assert!(wait_until_finished(&resolver, interval + Duration::from_millis(250)));
        assert_eq!(resolver.try_take_result(Duration::from_millis(10)), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let (lookup, _) = FixedLookup::new("1 2");
        let mut resolver =
            GeoResolver::start(StaticProbe(Connectivity::Other(20)), lookup, FAST_POLL);
        resolver.stop();
        resolver.stop();
        resolver.stop();
        assert!(wait_until_finished(&resolver, Duration::from_secs(1)));
        assert_eq!(resolver.poll_result(), None);
    }

    #[test]
    fn poll_result_does_not_block() {
        let (lookup, _) = FixedLookup::new("1 2");
        let mut resolver =
            GeoResolver::start(StaticProbe(Connectivity::Other(20)), lookup, FAST_POLL);
        let started = Instant::now();
        assert_eq!(resolver.poll_result(), None);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn late_result_can_be_polled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = FlakyProbe {
            errors: 5,
            after: Connectivity::ConnectedGlobal,
            calls,
        };
        let (lookup, _) = FixedLookup::new("35.6762 139.6503");
        let mut resolver = GeoResolver::start(probe, lookup, FAST_POLL);
        assert_eq!(resolver.try_take_result(Duration::from_millis(1)), None);
        let mut coords = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while coords.is_none() && Instant::now() < deadline {
            coords = resolver.poll_result();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(coords, Coordinates::new(35.6762, 139.6503));
    }
}
