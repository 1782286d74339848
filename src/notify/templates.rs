//! Plain-text notice rendering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::Payload;
use crate::storage::{StoredViolation, VehicleOwner};

const DEFAULT_SENDER: &str = "Traffic Enforcement Unit";
const DEFAULT_PAYMENT_URL: &str = "https://traffic.gov/pay-fine";
const DEFAULT_PAYMENT_WINDOW_DAYS: u32 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeSettings {
    pub sender: String,
    pub payment_url: String,
    pub payment_window_days: u32,
}

impl Default for NoticeSettings {
    fn default() -> Self {
        Self {
            sender: DEFAULT_SENDER.to_string(),
            payment_url: DEFAULT_PAYMENT_URL.to_string(),
            payment_window_days: DEFAULT_PAYMENT_WINDOW_DAYS,
        }
    }
}

/// A settled fine, used to render a payment receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FineReceipt {
    pub transaction_id: String,
    pub recipient: String,
    pub paid_at: u64,
    pub amount_cents: u64,
    pub payment_method: String,
}

pub fn format_timestamp(epoch_s: u64) -> String {
    i64::try_from(epoch_s)
        .ok()
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| epoch_s.to_string())
}

pub fn format_amount(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

/// Notice for one recorded violation. Carries the `violation:<id>` idempotency key.
pub fn violation_notice(
    settings: &NoticeSettings,
    violation: &StoredViolation,
    owner: &VehicleOwner,
) -> Payload {
    let kind = violation.violation.kind();
    let plate = violation
        .violation
        .license_plate()
        .unwrap_or(owner.license_plate.as_str());
    let body = format!(
        "Traffic Violation Notice\n\
         \n\
         Dear {name},\n\
         \n\
         Date: {date}\n\
         License Plate: {plate}\n\
         Violation Type: {code} {description}\n\
         Severity: {severity}\n\
         Fine Amount: {fine}\n\
         \n\
         Please pay the fine within {days} days to avoid additional penalties.\n\
         Payment can be made online at: {url}\n\
         \n\
         This is an automated message from {sender}. Do not reply to this email.\n",
        name = owner.owner_name,
        date = format_timestamp(violation.violation.created_at()),
        plate = plate,
        code = kind.code(),
        description = kind.description(),
        severity = kind.severity(),
        fine = format_amount(kind.fine_amount_cents()),
        days = settings.payment_window_days,
        url = settings.payment_url,
        sender = settings.sender,
    );
    let mut payload = Payload::new(
        owner.email.clone(),
        format!("Traffic Violation Notice - {}", plate),
        body,
    )
    .with_idempotency_key(format!("violation:{}", violation.id));
    if let Some(path) = &violation.image_path {
        payload = payload.with_attachment(path.clone());
    }
    payload
}

pub fn fine_receipt(settings: &NoticeSettings, receipt: &FineReceipt) -> Payload {
    let body = format!(
        "Payment Receipt - Traffic Violation Fine\n\
         \n\
         Transaction ID: {tx}\n\
         Date: {date}\n\
         Amount Paid: {amount}\n\
         Payment Method: {method}\n\
         \n\
         Thank you for your payment.\n\
         {sender}\n",
        tx = receipt.transaction_id,
        date = format_timestamp(receipt.paid_at),
        amount = format_amount(receipt.amount_cents),
        method = receipt.payment_method,
        sender = settings.sender,
    );
    Payload::new(
        receipt.recipient.clone(),
        "Payment Receipt - Traffic Violation Fine",
        body,
    )
    .with_idempotency_key(format!("receipt:{}", receipt.transaction_id))
}
