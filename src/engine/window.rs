//! Time-based admission checks, evaluated in a fixed order.

use crate::model::{ClassSession, Ms, HOUR_MS};

use super::AdmissionError;

/// Checks 2–4 of the admission order: started, closed, not yet open.
pub fn check_booking_window(class: &ClassSession, now: Ms) -> Result<(), AdmissionError> {
    if now >= class.start_time {
        return Err(AdmissionError::ClassAlreadyStarted);
    }
    let closes_at = class.booking_closes_at();
    if now > closes_at {
        return Err(AdmissionError::BookingWindowClosed { closes_at });
    }
    if let Some(opens_at) = class.booking_opens_at()
        && now < opens_at
    {
        let hours_until_open = ceil_div(opens_at - now, HOUR_MS);
        return Err(AdmissionError::BookingWindowNotYetOpen {
            opens_at,
            hours_until_open,
            days_until_open: hours_until_open.div_ceil(24),
        });
    }
    Ok(())
}

/// Self-service cancellation cutoff. Staff are not subject to it.
pub fn check_cancellation_deadline(class: &ClassSession, now: Ms) -> Result<(), AdmissionError> {
    let deadline = class.cancellation_deadline();
    if now > deadline {
        return Err(AdmissionError::CancellationDeadlinePassed { deadline });
    }
    Ok(())
}

fn ceil_div(n: Ms, d: Ms) -> u32 {
    let q = (n + d - 1) / d;
    q.clamp(0, u32::MAX as Ms) as u32
}
