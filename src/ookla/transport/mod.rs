//! Wire protocols of packet-loss-capable test servers: the text-line TCP
//! control channel and the sequenced UDP data channel.

pub mod tcp;
pub mod udp;

pub use tcp::Client;
pub use udp::PacketLossSender;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Packet-loss counters as reported by a server's control channel.
///
/// `max` is the highest sequence number the server observed, so the number
/// of datagrams it expected is `max + 1`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct PLoss {
    /// Unique datagrams the server received.
    pub sent: i64,
    /// Duplicate datagrams the server received.
    pub dup: i64,
    /// Highest sequence number observed.
    pub max: i64,
}

impl PLoss {
    /// Loss fraction in `[0, 1]`, or -1 when nothing was sent.
    pub fn loss(&self) -> f64 {
        if self.sent <= 0 {
            return -1.0;
        }

        1.0 - (self.sent - self.dup) as f64 / (self.max + 1) as f64
    }

    /// Loss percentage, or -1 when nothing was sent.
    pub fn loss_percent(&self) -> f64 {
        let loss = self.loss();
        if loss < 0.0 {
            return -1.0;
        }

        loss * 100.0
    }
}

impl Add for PLoss {
    type Output = PLoss;

    fn add(self, other: PLoss) -> PLoss {
        PLoss {
            sent: self.sent + other.sent,
            dup: self.dup + other.dup,
            max: self.max + other.max,
        }
    }
}

impl AddAssign for PLoss {
    fn add_assign(&mut self, other: PLoss) {
        *self = *self + other;
    }
}

impl fmt::Display for PLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sent <= 0 {
            return f.write_str("Packet Loss: N/A");
        }

        write!(
            f,
            "Packet Loss: {:.2}% (Sent: {}/Dup: {}/Max: {})",
            self.loss_percent(),
            self.sent,
            self.dup,
            self.max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_sentinel_on_zero_sent() {
        let p = PLoss::default();
        assert_eq!(p.loss(), -1.0);
        assert_eq!(p.loss_percent(), -1.0);
        assert_eq!(p.to_string(), "Packet Loss: N/A");
    }

    #[test]
    fn test_loss_known_values() {
        let p = PLoss { sent: 90, dup: 5, max: 100 };
        assert!((p.loss() - 0.15841584158415845).abs() < 1e-9);
        assert!((p.loss_percent() - 15.841584158415845).abs() < 1e-9);
        assert_eq!(
            p.to_string(),
            "Packet Loss: 15.84% (Sent: 90/Dup: 5/Max: 100)"
        );

        let p = PLoss { sent: 100, dup: 0, max: 100 };
        assert!((p.loss() - 0.00990099009900991).abs() < 1e-9);
    }

    #[test]
    fn test_loss_stays_in_unit_interval() {
        for sent in [1i64, 10, 100, 1000] {
            for dup in [0i64, 1, 5] {
                let p = PLoss { sent, dup, max: sent + dup - 1 };
                let loss = p.loss();
                assert!((0.0..=1.0).contains(&loss), "loss {loss} for {p:?}");
            }
        }
    }

    #[test]
    fn test_aggregation_sums_fields() {
        let a = PLoss { sent: 100, dup: 2, max: 100 };
        let b = PLoss { sent: 50, dup: 0, max: 50 };

        let mut sum = a;
        sum += b;
        assert_eq!(sum, PLoss { sent: 150, dup: 2, max: 150 });
        assert_eq!(a + b, sum);
    }
}
