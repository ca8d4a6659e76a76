use crate::options::{millis, ConnectionOptions};

/// Round-trip time estimation along the lines of RFC 6298. All values are in milliseconds.
#[derive(Clone, Debug, PartialEq)]
pub struct RttEstimator {
    smoothed_rtt: u64,
    rtt_variance: u64,
    rto: u64,
    min_rto: u64,
    max_rto: u64,
    has_sample: bool,
}

impl RttEstimator {
    const ALPHA_SHIFT: u32 = 3; // 1/8
    const BETA_SHIFT: u32 = 2;  // 1/4

    pub fn new(options: &ConnectionOptions) -> RttEstimator {
        let min_rto = millis(options.min_resend_delay);
        let max_rto = millis(options.max_resend_delay);
        let initial_rtt = millis(options.initial_rtt);

        RttEstimator {
            smoothed_rtt: initial_rtt,
            rtt_variance: initial_rtt / 2,
            rto: millis(options.initial_rto).clamp(min_rto, max_rto),
            min_rto,
            max_rto,
            has_sample: false,
        }
    }

    pub fn rtt(&self) -> u64 {
        self.smoothed_rtt
    }

    pub fn rto(&self) -> u64 {
        self.rto
    }

    pub fn on_sample(&mut self, sample: u64) {
        if self.has_sample {
            let deviation = self.smoothed_rtt.abs_diff(sample);
            self.rtt_variance = self.rtt_variance - (self.rtt_variance >> Self::BETA_SHIFT) + (deviation >> Self::BETA_SHIFT);
            self.smoothed_rtt = self.smoothed_rtt - (self.smoothed_rtt >> Self::ALPHA_SHIFT) + (sample >> Self::ALPHA_SHIFT);
        }
        else {
            self.smoothed_rtt = sample;
            self.rtt_variance = sample / 2;
            self.has_sample = true;
        }

        self.rto = self.smoothed_rtt
            .saturating_add(4 * self.rtt_variance)
            .clamp(self.min_rto, self.max_rto);
    }

    /// The delay before the `num_sends`-th send of a block is retransmitted: exponential backoff
    ///  on top of the RTO, capped at the maximum resend delay
    pub fn resend_delay(&self, num_sends: u32) -> u64 {
        let shift = num_sends.saturating_sub(1).min(16);
        self.rto
            .saturating_mul(1 << shift)
            .min(self.max_rto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            initial_rtt: Duration::from_millis(8000),
            initial_rto: Duration::from_millis(9000),
            min_resend_delay: Duration::from_millis(100),
            max_resend_delay: Duration::from_millis(45000),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial() {
        let rtt = RttEstimator::new(&options());
        assert_eq!(rtt.rtt(), 8000);
        assert_eq!(rtt.rto(), 9000);
    }

    #[rstest]
    #[case::single(vec![400], 400, 1200)]
    #[case::stable(vec![400, 400], 400, 1000)]
    #[case::jump(vec![400, 800], 450, 1450)]
    #[case::tiny(vec![1], 1, 100)]
    #[case::huge(vec![100_000], 100_000, 45_000)]
    fn test_samples(#[case] samples: Vec<u64>, #[case] expected_rtt: u64, #[case] expected_rto: u64) {
        let mut rtt = RttEstimator::new(&options());
        for sample in samples {
            rtt.on_sample(sample);
        }
        assert_eq!(rtt.rtt(), expected_rtt);
        assert_eq!(rtt.rto(), expected_rto);
    }

    #[rstest]
    #[case(1, 9000)]
    #[case(2, 18000)]
    #[case(3, 36000)]
    #[case(4, 45000)]
    #[case(100, 45000)]
    fn test_resend_delay(#[case] num_sends: u32, #[case] expected: u64) {
        assert_eq!(RttEstimator::new(&options()).resend_delay(num_sends), expected);
    }
}
