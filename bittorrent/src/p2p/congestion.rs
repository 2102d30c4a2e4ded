// Bounded request window: min(remote_reqq, local_cwnd). local_cwnd grows additively on
// successful deliveries and shrinks multiplicatively on timeout/reject, the same shape as
// the teacher's throughput Counter's rolling average, applied to a request count instead.

use std::time::{Duration, Instant};

const INITIAL_CWND: usize = 4;
const MAX_CWND: usize = 500;
const MIN_CWND: usize = 1;
const DEFAULT_REMOTE_REQQ: usize = 250;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_RESEND: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct InFlightRequest {
    pub sent_at: Instant,
    pub resend_count: u8,
}

#[derive(Debug)]
pub struct Congestion {
    cwnd: usize,
    remote_reqq: usize,
}

impl Default for Congestion {
    fn default() -> Self {
        Self { cwnd: INITIAL_CWND, remote_reqq: DEFAULT_REMOTE_REQQ }
    }
}

impl Congestion {
    pub fn window(&self) -> usize {
        self.cwnd.min(self.remote_reqq)
    }

    pub fn set_remote_reqq(&mut self, reqq: usize) {
        self.remote_reqq = reqq.max(1);
    }

    pub fn on_delivery(&mut self) {
        self.cwnd = (self.cwnd + 1).min(MAX_CWND);
    }

    pub fn on_timeout_or_reject(&mut self) {
        self.cwnd = (self.cwnd / 2).max(MIN_CWND);
    }

    // Whether a pending request has been outstanding long enough to re-queue, and whether
    // it has exhausted its resend budget (persistent timeout closes the peer).
    pub fn is_expired(&self, req: &InFlightRequest, now: Instant) -> bool {
        now.saturating_duration_since(req.sent_at) >= REQUEST_TIMEOUT
    }

    pub fn exhausted(&self, req: &InFlightRequest) -> bool {
        req.resend_count >= MAX_RESEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded_by_remote_reqq() {
        let mut c = Congestion::default();
        c.set_remote_reqq(2);
        for _ in 0..100 {
            c.on_delivery();
        }
        assert_eq!(c.window(), 2);
    }

    #[test]
    fn cwnd_shrinks_on_timeout() {
        let mut c = Congestion::default();
        for _ in 0..20 {
            c.on_delivery();
        }
        let grown = c.window();
        c.on_timeout_or_reject();
        assert!(c.window() < grown);
    }
}
