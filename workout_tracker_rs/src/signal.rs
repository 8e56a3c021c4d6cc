//! GPS signal quality and the loss-recovery mode.
//!
//! Recovery mode is entered when fixes stop arriving or when the validator
//! keeps seeing physically impossible jumps. While in it, accepted fixes only
//! re-anchor; accrual resumes once the signal is clean again or the mode has
//! lasted too long.

use crate::config::SignalConfig;
use crate::types::SignalStrength;
use crate::validator::RejectReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryCause {
    SignalLost,
    Discontinuity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalTransition {
    /// No fix within the loss window
    Lost,
    /// Enough consecutive clean fixes while recovering
    Restored,
    /// Recovery lasted too long and was forced to end
    RecoveryTimeout,
    /// Repeated speed/jump rejections
    Discontinuity,
}

#[derive(Clone, Copy, Debug)]
struct RecoveryMode {
    cause: RecoveryCause,
    entered_ms: i64,
    good_fixes: u32,
}

#[derive(Clone, Debug)]
pub struct SignalMonitor {
    config: SignalConfig,
    tracking_since_ms: Option<i64>,
    last_fix_ms: Option<i64>,
    last_accuracy: Option<f64>,
    consecutive_discontinuities: u32,
    recovery: Option<RecoveryMode>,
}

impl SignalMonitor {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            tracking_since_ms: None,
            last_fix_ms: None,
            last_accuracy: None,
            consecutive_discontinuities: 0,
            recovery: None,
        }
    }

    pub fn start(&mut self, now_ms: i64) {
        self.tracking_since_ms = Some(now_ms);
        self.last_fix_ms = None;
        self.last_accuracy = None;
        self.consecutive_discontinuities = 0;
        self.recovery = None;
    }

    pub fn stop(&mut self) {
        self.tracking_since_ms = None;
        self.recovery = None;
        self.consecutive_discontinuities = 0;
    }

    /// Restart the loss window without forgetting the last fix quality.
    pub fn rearm(&mut self, now_ms: i64) {
        self.tracking_since_ms = Some(now_ms);
        self.last_fix_ms = None;
        self.consecutive_discontinuities = 0;
    }

    pub fn strength(&self, now_ms: i64) -> SignalStrength {
        let Some(since) = self.tracking_since_ms else {
            return SignalStrength::None;
        };
        let Some(last_fix) = self.last_fix_ms else {
            return SignalStrength::Searching;
        };
        let age_secs = (now_ms - last_fix.max(since)) as f64 / 1000.0;
        if age_secs > self.config.searching_after_secs {
            return SignalStrength::Searching;
        }
        match self.last_accuracy {
            Some(acc) if acc <= self.config.strong_accuracy_m => SignalStrength::Strong,
            Some(acc) if acc <= self.config.medium_accuracy_m => SignalStrength::Medium,
            Some(_) => SignalStrength::Weak,
            None => SignalStrength::Medium,
        }
    }

    /// Any fix delivered by the provider, accepted or not.
    pub fn record_fix(&mut self, timestamp_ms: i64, accuracy: Option<f64>) {
        self.last_fix_ms = Some(self.last_fix_ms.map_or(timestamp_ms, |t| t.max(timestamp_ms)));
        self.last_accuracy = accuracy;
    }

    pub fn record_accepted(&mut self) {
        self.consecutive_discontinuities = 0;
    }

    /// Returns `Discontinuity` when rejections pile up enough to re-anchor.
    pub fn record_rejection(&mut self, reason: RejectReason, now_ms: i64) -> Option<SignalTransition> {
        if !reason.is_discontinuity() {
            return None;
        }
        self.consecutive_discontinuities += 1;
        if self.consecutive_discontinuities < self.config.max_consecutive_rejections {
            return None;
        }
        self.consecutive_discontinuities = 0;
        self.enter_recovery(RecoveryCause::Discontinuity, now_ms);
        Some(SignalTransition::Discontinuity)
    }

    fn enter_recovery(&mut self, cause: RecoveryCause, now_ms: i64) {
        if self.recovery.is_none() {
            log::warn!("entering GPS recovery mode ({:?})", cause);
            self.recovery = Some(RecoveryMode {
                cause,
                entered_ms: now_ms,
                good_fixes: 0,
            });
        }
    }

    pub fn in_recovery(&self) -> bool {
        self.recovery.is_some()
    }

    pub fn recovery_cause(&self) -> Option<RecoveryCause> {
        self.recovery.map(|r| r.cause)
    }

    /// Feed an accepted fix while recovering.
    pub fn recovery_fix(&mut self, accuracy: Option<f64>, now_ms: i64) -> Option<SignalTransition> {
        let good_accuracy = self.config.recovery_good_accuracy_m;
        let needed = self.config.recovery_good_samples;
        let mode = self.recovery.as_mut()?;
        let clean = accuracy.map_or(true, |a| a <= good_accuracy);
        mode.good_fixes = if clean { mode.good_fixes + 1 } else { 0 };
        if mode.good_fixes >= needed {
            self.recovery = None;
            log::info!("GPS signal restored");
            return Some(SignalTransition::Restored);
        }
        self.check_recovery_timeout(now_ms)
    }

    fn check_recovery_timeout(&mut self, now_ms: i64) -> Option<SignalTransition> {
        let mode = self.recovery?;
        let elapsed = (now_ms - mode.entered_ms) as f64 / 1000.0;
        if elapsed > self.config.recovery_timeout_secs {
            self.recovery = None;
            log::warn!("GPS recovery timed out after {:.0} s, forcing exit", elapsed);
            return Some(SignalTransition::RecoveryTimeout);
        }
        None
    }

    /// Periodic check: signal loss and recovery timeout.
    pub fn check(&mut self, now_ms: i64) -> Option<SignalTransition> {
        let since = self.tracking_since_ms?;
        if self.recovery.is_some() {
            return self.check_recovery_timeout(now_ms);
        }
        let reference = self.last_fix_ms.map_or(since, |t| t.max(since));
        if (now_ms - reference) as f64 / 1000.0 > self.config.lost_after_secs {
            self.enter_recovery(RecoveryCause::SignalLost, now_ms);
            return Some(SignalTransition::Lost);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SignalMonitor {
        let mut m = SignalMonitor::new(SignalConfig::default());
        m.start(0);
        m
    }

    #[test]
    fn test_strength_levels() {
        let mut m = SignalMonitor::new(SignalConfig::default());
        assert_eq!(m.strength(0), SignalStrength::None);
        m.start(0);
        assert_eq!(m.strength(1_000), SignalStrength::Searching);
        m.record_fix(1_000, Some(5.0));
        assert_eq!(m.strength(1_500), SignalStrength::Strong);
        m.record_fix(2_000, Some(15.0));
        assert_eq!(m.strength(2_500), SignalStrength::Medium);
        m.record_fix(3_000, Some(30.0));
        assert_eq!(m.strength(3_500), SignalStrength::Weak);
        assert_eq!(m.strength(14_000), SignalStrength::Searching);
    }

    #[test]
    fn test_loss_enters_recovery_once() {
        let mut m = monitor();
        m.record_fix(1_000, Some(5.0));
        assert_eq!(m.check(10_000), None);
        assert_eq!(m.check(17_000), Some(SignalTransition::Lost));
        assert!(m.in_recovery());
        assert_eq!(m.check(18_000), None);
    }

    #[test]
    fn test_restored_after_clean_fixes() {
        let mut m = monitor();
        m.check(20_000);
        assert_eq!(m.recovery_fix(Some(8.0), 21_000), None);
        assert_eq!(m.recovery_fix(Some(30.0), 22_000), None);
        assert_eq!(m.recovery_fix(Some(8.0), 23_000), None);
        assert_eq!(m.recovery_fix(Some(8.0), 24_000), None);
        assert_eq!(m.recovery_fix(Some(8.0), 25_000), Some(SignalTransition::Restored));
        assert!(!m.in_recovery());
    }

    #[test]
    fn test_recovery_timeout_forces_exit() {
        let mut m = monitor();
        m.check(20_000);
        assert_eq!(m.recovery_fix(Some(40.0), 30_000), None);
        assert_eq!(m.check(51_000), Some(SignalTransition::RecoveryTimeout));
        assert!(!m.in_recovery());
    }

    #[test]
    fn test_repeated_jumps_trigger_discontinuity() {
        let mut m = monitor();
        for _ in 0..4 {
            assert_eq!(m.record_rejection(RejectReason::TooFast, 1_000), None);
        }
        assert_eq!(m.record_rejection(RejectReason::Jitter, 1_000), None);
        assert_eq!(
            m.record_rejection(RejectReason::Teleport, 1_000),
            Some(SignalTransition::Discontinuity)
        );
        assert_eq!(m.recovery_cause(), Some(RecoveryCause::Discontinuity));
    }

    #[test]
    fn test_accepted_fix_clears_rejection_streak() {
        let mut m = monitor();
        for _ in 0..4 {
            m.record_rejection(RejectReason::TooFast, 1_000);
        }
        m.record_accepted();
        assert_eq!(m.record_rejection(RejectReason::TooFast, 1_000), None);
    }
}
