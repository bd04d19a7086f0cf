//! Byte-rate values and their textual rendering.
//!
//! A [`ByteRate`] is bytes per second. Formatting supports four auto-scaled
//! unit families (IEC and SI, bits and bytes) plus the fixed two-decimal
//! Mbps rendering the CLI surface defaults to. The unit family is always an
//! explicit argument; there is no process-wide unit setting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit families for rendering a byte rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitType {
    /// Auto-scaled decimal bits: bps, Kbps, Mbps, Gbps.
    DecimalBits,
    /// Auto-scaled decimal bytes: B/s, KB/s, MB/s, GB/s.
    DecimalBytes,
    /// Auto-scaled binary bits: Kibps, KiMbps, KiGbps.
    BinaryBits,
    /// Auto-scaled binary bytes: KiB/s, MiB/s, GiB/s.
    BinaryBytes,
    /// Fixed rendering as `X.XX Mbps`.
    #[default]
    DefaultMbps,
}

const DECIMAL_BITS_UNITS: [&str; 4] = ["bps", "Kbps", "Mbps", "Gbps"];
const DECIMAL_BYTES_UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
const BINARY_BITS_UNITS: [&str; 3] = ["Kibps", "KiMbps", "KiGbps"];
const BINARY_BYTES_UNITS: [&str; 3] = ["KiB/s", "MiB/s", "GiB/s"];

const KILOBYTE: f64 = 1000.0;
const MEGABYTE: f64 = 1000.0 * KILOBYTE;
const GIGABYTE: f64 = 1000.0 * MEGABYTE;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * KIB;
const GIB: f64 = 1024.0 * MIB;

/// Bytes per second with unavailable (-1) as a sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize,
)]
pub struct ByteRate(pub f64);

impl ByteRate {
    /// Sentinel for a rate that could not be measured.
    pub const UNAVAILABLE: ByteRate = ByteRate(-1.0);

    /// True unless this is the unavailable sentinel.
    pub fn is_available(&self) -> bool {
        self.0 >= 0.0
    }

    /// The rate in megabits per second.
    pub fn mbps(&self) -> f64 {
        self.0 / 125_000.0
    }

    /// The rate in gigabits per second.
    pub fn gbps(&self) -> f64 {
        self.0 / 125_000_000.0
    }

    /// Renders the rate in the requested unit family.
    pub fn format(&self, unit: UnitType) -> String {
        if self.0 == 0.0 {
            return "0.00 Mbps".to_string();
        }

        if self.0 == -1.0 {
            return "N/A".to_string();
        }

        match unit {
            UnitType::DefaultMbps => format!("{:.2} Mbps", self.mbps()),
            UnitType::DecimalBits => {
                format_decimal(self.0, self.0 * 8.0, &DECIMAL_BITS_UNITS)
            }
            UnitType::DecimalBytes => {
                format_decimal(self.0, self.0, &DECIMAL_BYTES_UNITS)
            }
            UnitType::BinaryBits => {
                format_binary(self.0, self.0 * 8.0, &BINARY_BITS_UNITS)
            }
            UnitType::BinaryBytes => {
                format_binary(self.0, self.0, &BINARY_BYTES_UNITS)
            }
        }
    }
}

/// Scale selection uses the raw byte rate; the printed value may already be
/// converted to bits.
fn format_decimal(byte_rate: f64, val: f64, units: &[&str; 4]) -> String {
    if byte_rate >= GIGABYTE {
        format!("{:.2} {}", val / GIGABYTE, units[3])
    } else if byte_rate >= MEGABYTE {
        format!("{:.2} {}", val / MEGABYTE, units[2])
    } else if byte_rate >= KILOBYTE {
        format!("{:.2} {}", val / KILOBYTE, units[1])
    } else {
        format!("{:.2} {}", val, units[0])
    }
}

fn format_binary(byte_rate: f64, val: f64, units: &[&str; 3]) -> String {
    if byte_rate >= GIB {
        format!("{:.2} {}", val / GIB, units[2])
    } else if byte_rate >= MIB {
        format!("{:.2} {}", val / MIB, units[1])
    } else {
        format!("{:.2} {}", val / KIB, units[0])
    }
}

impl fmt::Display for ByteRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(UnitType::DefaultMbps))
    }
}

impl From<f64> for ByteRate {
    fn from(rate: f64) -> Self {
        ByteRate(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(ByteRate(0.0).to_string(), "0.00 Mbps");
        assert_eq!(ByteRate::UNAVAILABLE.to_string(), "N/A");
        assert_eq!(ByteRate(-1.0).format(UnitType::BinaryBytes), "N/A");
        assert!(!ByteRate::UNAVAILABLE.is_available());
        assert!(ByteRate(1.0).is_available());
    }

    #[test]
    fn test_default_mbps() {
        // 1_250_000 B/s = 10 Mbps
        assert_eq!(ByteRate(1_250_000.0).to_string(), "10.00 Mbps");
        assert!((ByteRate(1_250_000.0).mbps() - 10.0).abs() < 1e-9);
        assert!((ByteRate(125_000_000.0).gbps() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decimal_families() {
        let rate = ByteRate(2_500_000.0);
        assert_eq!(rate.format(UnitType::DecimalBits), "20.00 Mbps");
        assert_eq!(rate.format(UnitType::DecimalBytes), "2.50 MB/s");

        // scale selection follows the byte rate, so 500 B/s stays in the
        // lowest tier even though the bit value crosses 1000
        let slow = ByteRate(500.0);
        assert_eq!(slow.format(UnitType::DecimalBits), "4000.00 bps");
        assert_eq!(slow.format(UnitType::DecimalBytes), "500.00 B/s");

        let fast = ByteRate(2_000_000_000.0);
        assert_eq!(fast.format(UnitType::DecimalBits), "16.00 Gbps");
        assert_eq!(fast.format(UnitType::DecimalBytes), "2.00 GB/s");
    }

    #[test]
    fn test_binary_families() {
        let rate = ByteRate(1_048_576.0); // exactly 1 MiB/s
        assert_eq!(rate.format(UnitType::BinaryBytes), "1.00 MiB/s");
        assert_eq!(rate.format(UnitType::BinaryBits), "8.00 KiMbps");

        let slow = ByteRate(512.0);
        assert_eq!(slow.format(UnitType::BinaryBytes), "0.50 KiB/s");

        let fast = ByteRate(GIB * 2.0);
        assert_eq!(fast.format(UnitType::BinaryBytes), "2.00 GiB/s");
        assert_eq!(fast.format(UnitType::BinaryBits), "16.00 KiGbps");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: the decimal-bits rendering is invertible. The printed
        /// prefix times its unit divisor recovers 8x the byte rate, within
        /// two-decimal rounding of the prefix.
        #[test]
        fn decimal_bits_roundtrip(rate in 1.0f64..10.0e9) {
            let text = ByteRate(rate).format(UnitType::DecimalBits);
            let mut parts = text.split_whitespace();
            let prefix: f64 = parts.next().unwrap().parse().unwrap();
            let divisor = match parts.next().unwrap() {
                "bps" => 1.0,
                "Kbps" => KILOBYTE,
                "Mbps" => MEGABYTE,
                "Gbps" => GIGABYTE,
                other => panic!("unexpected unit {other}"),
            };

            let recovered = prefix * divisor;
            // prefix is rounded to 2 decimals: half a unit in the last place
            let tolerance = 0.005 * divisor + 1e-9;
            prop_assert!(
                (recovered - rate * 8.0).abs() <= tolerance,
                "{} -> {} recovered {} expected {}",
                rate, text, recovered, rate * 8.0
            );
        }

        /// Property: formatting never emits an empty string and always has
        /// a numeric prefix.
        #[test]
        fn all_families_render(rate in 0.0f64..10.0e9) {
            for unit in [
                UnitType::DecimalBits,
                UnitType::DecimalBytes,
                UnitType::BinaryBits,
                UnitType::BinaryBytes,
                UnitType::DefaultMbps,
            ] {
                let text = ByteRate(rate).format(unit);
                prop_assert!(!text.is_empty());
                let prefix = text.split_whitespace().next().unwrap();
                prop_assert!(prefix.parse::<f64>().is_ok() || prefix == "N/A");
            }
        }
    }
}
