use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// RTT samples are clamped to this upper bound to keep a single outlier from dominating
///  resend timing
const MAX_RTT_SECONDS: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum AverageRtt {
    Unknown,
    /// seeded from the handshake duration, replaced by the first ping round trip
    Preliminary(f64),
    Measured(f64),
}

/// Smoothed round-trip time for a connection, measured by ping / pong exchanges. It also
///  tracks when the remote side last responded to anything we sent, which is the basis for
///  timeout detection.
pub struct LatencyEstimator {
    avg: AverageRtt,
    new_sample_weight: f64,
    last_send_responded_to: Instant,
    next_ping_id: u8,
    pending_ping: Option<(u8, Instant)>,
    last_ping_sent: Option<Instant>,
}

impl LatencyEstimator {
    pub fn new(new_sample_weight: f64, now: Instant) -> LatencyEstimator {
        LatencyEstimator {
            avg: AverageRtt::Unknown,
            new_sample_weight,
            last_send_responded_to: now,
            next_ping_id: 0,
            pending_ping: None,
            last_ping_sent: None,
        }
    }

    fn clamped_seconds(rtt: Duration) -> f64 {
        rtt.as_secs_f64().clamp(0.0, MAX_RTT_SECONDS)
    }

    pub fn seed_from_handshake(&mut self, handshake_duration: Duration) {
        let seconds = Self::clamped_seconds(handshake_duration);
        debug!("seeding RTT from handshake: {}ms", seconds * 1000.0);
        self.avg = AverageRtt::Preliminary(seconds);
    }

    pub fn add_sample(&mut self, rtt: Duration) {
        let sample = Self::clamped_seconds(rtt);

        self.avg = match self.avg {
            AverageRtt::Measured(prev) => {
                let alpha = self.new_sample_weight;
                AverageRtt::Measured(prev * (1.0 - alpha) + sample * alpha)
            }
            AverageRtt::Unknown | AverageRtt::Preliminary(_) => AverageRtt::Measured(sample),
        };
        trace!("RTT sample {}ms, moving avg {}ms", sample * 1000.0, self.avg_rtt().as_secs_f64() * 1000.0);
    }

    /// The smoothed RTT, or zero if there was no measurement yet
    pub fn avg_rtt(&self) -> Duration {
        match self.avg {
            AverageRtt::Unknown => Duration::ZERO,
            AverageRtt::Preliminary(s) | AverageRtt::Measured(s) => Duration::from_secs_f64(s),
        }
    }

    pub fn is_ping_due(&self, now: Instant, ping_frequency: Duration) -> bool {
        match self.last_ping_sent {
            None => true,
            Some(t) => now.duration_since(t) >= ping_frequency,
        }
    }

    /// returns the ping id to send
    pub fn on_ping_sent(&mut self, now: Instant) -> u8 {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.pending_ping = Some((id, now));
        self.last_ping_sent = Some(now);
        id
    }

    /// A pong for anything but the most recent ping is ignored since its send time is unknown
    pub fn on_pong(&mut self, ping_id: u8, now: Instant) {
        match self.pending_ping {
            Some((id, sent_at)) if id == ping_id => {
                self.pending_ping = None;
                self.on_response(now);
                self.add_sample(now.duration_since(sent_at));
            }
            _ => {
                debug!("ignoring pong for ping #{}", ping_id);
            }
        }
    }

    /// called when the remote side responds to something we sent, i.e. an ack or a pong
    pub fn on_response(&mut self, now: Instant) {
        if now > self.last_send_responded_to {
            self.last_send_responded_to = now;
        }
    }

    pub fn last_send_responded_to(&self) -> Instant {
        self.last_send_responded_to
    }

    pub fn is_timed_out(&self, now: Instant, connection_timeout: Duration) -> bool {
        now.duration_since(self.last_send_responded_to) > connection_timeout
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn millis(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[rstest]
    #[case::no_samples(None, vec![], 0)]
    #[case::seeded(Some(80), vec![], 80)]
    #[case::first_sample_replaces_seed(Some(80), vec![20], 20)]
    #[case::first_sample_without_seed(None, vec![40], 40)]
    #[case::moving_average(None, vec![100, 200], 125)]
    #[case::moving_average_after_seed(Some(500), vec![100, 200], 125)]
    #[case::clamped(None, vec![10_000], 4000)]
    fn test_avg_rtt(#[case] seed: Option<u64>, #[case] samples: Vec<u64>, #[case] expected_millis: u64) {
        let mut latency = LatencyEstimator::new(0.25, Instant::now());
        if let Some(seed) = seed {
            latency.seed_from_handshake(millis(seed));
        }
        for s in samples {
            latency.add_sample(millis(s));
        }

        assert_millis(latency.avg_rtt(), expected_millis);
    }

    fn assert_millis(actual: Duration, expected: u64) {
        let actual = actual.as_secs_f64() * 1000.0;
        assert!((actual - expected as f64).abs() < 0.001, "{} != {}", actual, expected);
    }

    #[test]
    fn test_ping_pong() {
        let start = Instant::now();
        let mut latency = LatencyEstimator::new(0.25, start);
        assert!(latency.is_ping_due(start, millis(1000)));

        let id = latency.on_ping_sent(start);
        assert!(!latency.is_ping_due(start + millis(999), millis(1000)));
        assert!(latency.is_ping_due(start + millis(1000), millis(1000)));

        latency.on_pong(id.wrapping_add(1), start + millis(10));
        assert_eq!(latency.avg_rtt(), Duration::ZERO);

        latency.on_pong(id, start + millis(30));
        assert_millis(latency.avg_rtt(), 30);
        assert_eq!(latency.last_send_responded_to(), start + millis(30));

        // a duplicate pong is ignored
        latency.on_pong(id, start + millis(60));
        assert_millis(latency.avg_rtt(), 30);
    }

    #[test]
    fn test_timeout() {
        let start = Instant::now();
        let mut latency = LatencyEstimator::new(0.25, start);
        assert!(!latency.is_timed_out(start + millis(100), millis(100)));
        assert!(latency.is_timed_out(start + millis(101), millis(100)));

        latency.on_response(start + millis(50));
        assert!(!latency.is_timed_out(start + millis(150), millis(100)));
        assert!(latency.is_timed_out(start + millis(151), millis(100)));
    }
}
