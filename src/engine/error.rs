use std::str::FromStr;

use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};
use crate::store::StorageError;

/// Language used for user-facing rejection messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Es,
}

impl FromStr for Locale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "en" | "en-us" | "en_us" => Ok(Locale::En),
            "es" | "es-mx" | "es_mx" | "es-es" | "es_es" => Ok(Locale::Es),
            other => Err(format!("unsupported locale: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("class {0} is not available for booking")]
    ClassUnavailable(Ulid),
    #[error("class has already started")]
    ClassAlreadyStarted,
    #[error("booking window closed at {closes_at}")]
    BookingWindowClosed { closes_at: Ms },
    #[error("booking opens at {opens_at} ({hours_until_open}h remaining)")]
    BookingWindowNotYetOpen {
        opens_at: Ms,
        hours_until_open: u32,
        days_until_open: u32,
    },
    #[error("daily limit of {limit} classes reached on {target_date} ({current_count} booked)")]
    DailyLimitReached {
        limit: u32,
        current_count: u32,
        target_date: NaiveDate,
    },
    #[error("membership invalid ({code}): {message}")]
    MembershipInvalid { code: String, message: String },
    #[error("member already holds a {status} booking for this class")]
    AlreadyBooked { status: BookingStatus },
    #[error("class is full")]
    ClassFull,
    #[error("class and waitlist are full")]
    WaitlistFull,
    #[error("booking is already {0}")]
    AlreadyFinal(BookingStatus),
    #[error("cancellation deadline passed at {deadline}")]
    CancellationDeadlinePassed { deadline: Ms },
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("actor may not act on this booking")]
    Forbidden,
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("invalid class: {0}")]
    InvalidClass(&'static str),
    #[error("class already exists: {0}")]
    ClassAlreadyExists(Ulid),
    #[error("storage timed out")]
    StorageTimeout,
    #[error("storage conflict on class {0}")]
    StorageConflict(Ulid),
    #[error("storage error: {0}")]
    Storage(String),
}

impl AdmissionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::ClassUnavailable(_) => "class_unavailable",
            AdmissionError::ClassAlreadyStarted => "class_already_started",
            AdmissionError::BookingWindowClosed { .. } => "booking_window_closed",
            AdmissionError::BookingWindowNotYetOpen { .. } => "booking_window_not_yet_open",
            AdmissionError::DailyLimitReached { .. } => "daily_limit_reached",
            AdmissionError::MembershipInvalid { .. } => "membership_invalid",
            AdmissionError::AlreadyBooked { .. } => "already_booked",
            AdmissionError::ClassFull => "class_full",
            AdmissionError::WaitlistFull => "waitlist_full",
            AdmissionError::AlreadyFinal(_) => "already_final",
            AdmissionError::CancellationDeadlinePassed { .. } => "cancellation_deadline_passed",
            AdmissionError::BookingNotFound(_) => "booking_not_found",
            AdmissionError::Forbidden => "forbidden",
            AdmissionError::InvalidTransition { .. } => "invalid_transition",
            AdmissionError::LimitExceeded(_) => "limit_exceeded",
            AdmissionError::InvalidClass(_) => "invalid_class",
            AdmissionError::ClassAlreadyExists(_) => "class_already_exists",
            AdmissionError::StorageTimeout => "storage_timeout",
            AdmissionError::StorageConflict(_) => "storage_conflict",
            AdmissionError::Storage(_) => "storage_error",
        }
    }

    /// Only infrastructure failures may be retried. Business answers are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::StorageTimeout
                | AdmissionError::StorageConflict(_)
                | AdmissionError::Storage(_)
        )
    }

    pub fn is_business(&self) -> bool {
        !self.is_retryable()
    }

    /// Message for direct display to the member or staff user.
    pub fn localized(&self, locale: Locale) -> String {
        match locale {
            Locale::En => self.english(),
            Locale::Es => self.spanish(),
        }
    }

    fn english(&self) -> String {
        match self {
            AdmissionError::ClassUnavailable(_) => "This class is not available.".into(),
            AdmissionError::ClassAlreadyStarted => "This class has already started.".into(),
            AdmissionError::BookingWindowClosed { .. } => {
                "Booking for this class has closed.".into()
            }
            AdmissionError::BookingWindowNotYetOpen {
                hours_until_open,
                days_until_open,
                ..
            } => {
                if *hours_until_open >= 24 {
                    format!("Booking opens in {days_until_open} {}.", plural(*days_until_open, "day", "days"))
                } else {
                    format!("Booking opens in {hours_until_open} {}.", plural(*hours_until_open, "hour", "hours"))
                }
            }
            AdmissionError::DailyLimitReached {
                limit, target_date, ..
            } => format!(
                "You have reached the limit of {limit} {} on {target_date}.",
                plural(*limit, "class", "classes")
            ),
            AdmissionError::MembershipInvalid { message, .. } => {
                format!("Your membership does not allow this booking: {message}.")
            }
            AdmissionError::AlreadyBooked { status } => match status {
                BookingStatus::Waitlist => "You are already on the waitlist for this class.".into(),
                _ => "You already have a booking for this class.".into(),
            },
            AdmissionError::ClassFull => "This class is full.".into(),
            AdmissionError::WaitlistFull => "This class and its waitlist are full.".into(),
            AdmissionError::AlreadyFinal(status) => {
                format!("This booking is already {}.", english_status(*status))
            }
            AdmissionError::CancellationDeadlinePassed { .. } => {
                "The cancellation deadline for this class has passed.".into()
            }
            AdmissionError::BookingNotFound(_) => "Booking not found.".into(),
            AdmissionError::Forbidden => "You can only manage your own bookings.".into(),
            AdmissionError::InvalidTransition { from, .. } => format!(
                "This booking cannot be updated because it is {}.",
                english_status(*from)
            ),
            AdmissionError::LimitExceeded(what) => format!("Request rejected: {what}."),
            AdmissionError::InvalidClass(what) => format!("Invalid class: {what}."),
            AdmissionError::ClassAlreadyExists(_) => "A class with this id already exists.".into(),
            AdmissionError::StorageTimeout => {
                "The service took too long to respond. Please try again.".into()
            }
            AdmissionError::StorageConflict(_) => {
                "The class is busy right now. Please try again.".into()
            }
            AdmissionError::Storage(_) => "Something went wrong. Please try again.".into(),
        }
    }

    fn spanish(&self) -> String {
        match self {
            AdmissionError::ClassUnavailable(_) => "Esta clase no está disponible.".into(),
            AdmissionError::ClassAlreadyStarted => "Esta clase ya comenzó.".into(),
            AdmissionError::BookingWindowClosed { .. } => {
                "Las reservas para esta clase ya cerraron.".into()
            }
            AdmissionError::BookingWindowNotYetOpen {
                hours_until_open,
                days_until_open,
                ..
            } => {
                if *hours_until_open >= 24 {
                    format!("Las reservas abren en {days_until_open} {}.", plural(*days_until_open, "día", "días"))
                } else {
                    format!("Las reservas abren en {hours_until_open} {}.", plural(*hours_until_open, "hora", "horas"))
                }
            }
            AdmissionError::DailyLimitReached {
                limit, target_date, ..
            } => format!(
                "Alcanzaste el límite de {limit} {} para el {}.",
                plural(*limit, "clase", "clases"),
                target_date.format("%d/%m/%Y")
            ),
            AdmissionError::MembershipInvalid { message, .. } => {
                format!("Tu membresía no permite esta reserva: {message}.")
            }
            AdmissionError::AlreadyBooked { status } => match status {
                BookingStatus::Waitlist => "Ya estás en la lista de espera de esta clase.".into(),
                _ => "Ya tienes una reserva para esta clase.".into(),
            },
            AdmissionError::ClassFull => "La clase está llena.".into(),
            AdmissionError::WaitlistFull => "La clase y su lista de espera están llenas.".into(),
            AdmissionError::AlreadyFinal(status) => {
                format!("Esta reserva ya está {}.", spanish_status(*status))
            }
            AdmissionError::CancellationDeadlinePassed { .. } => {
                "Ya pasó el plazo para cancelar esta clase.".into()
            }
            AdmissionError::BookingNotFound(_) => "Reserva no encontrada.".into(),
            AdmissionError::Forbidden => "Solo puedes gestionar tus propias reservas.".into(),
            AdmissionError::InvalidTransition { from, .. } => format!(
                "No se puede actualizar la reserva porque está {}.",
                spanish_status(*from)
            ),
            AdmissionError::LimitExceeded(what) => format!("Solicitud rechazada: {what}."),
            AdmissionError::InvalidClass(what) => format!("Clase inválida: {what}."),
            AdmissionError::ClassAlreadyExists(_) => "Ya existe una clase con este id.".into(),
            AdmissionError::StorageTimeout => {
                "El servicio tardó demasiado en responder. Inténtalo de nuevo.".into()
            }
            AdmissionError::StorageConflict(_) => {
                "La clase está ocupada en este momento. Inténtalo de nuevo.".into()
            }
            AdmissionError::Storage(_) => "Algo salió mal. Inténtalo de nuevo.".into(),
        }
    }
}

fn plural<'a>(n: u32, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 { one } else { many }
}

fn english_status(status: BookingStatus) -> &'static str {
    match status {
        BookingStatus::Confirmed => "confirmed",
        BookingStatus::Waitlist => "on the waitlist",
        BookingStatus::Cancelled => "cancelled",
        BookingStatus::Attended => "checked in",
        BookingStatus::NoShow => "marked as a no-show",
    }
}

fn spanish_status(status: BookingStatus) -> &'static str {
    match status {
        BookingStatus::Confirmed => "confirmada",
        BookingStatus::Waitlist => "en lista de espera",
        BookingStatus::Cancelled => "cancelada",
        BookingStatus::Attended => "registrada como asistida",
        BookingStatus::NoShow => "marcada como inasistencia",
    }
}

impl From<StorageError> for AdmissionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Conflict(id) => AdmissionError::StorageConflict(id),
            StorageError::Timeout => AdmissionError::StorageTimeout,
            StorageError::UniqueViolation { .. } => AdmissionError::AlreadyBooked {
                status: BookingStatus::Confirmed,
            },
            StorageError::RowNotFound(id) => AdmissionError::BookingNotFound(id),
            StorageError::LimitExceeded(what) => AdmissionError::LimitExceeded(what),
            other => AdmissionError::Storage(other.to_string()),
        }
    }
}
