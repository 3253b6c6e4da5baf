//! Reconciles VNPay callbacks with invoices.
//!
//! The browser return and the server-to-server IPN carry the same signed
//! result. Either may arrive first, both may arrive more than once, and
//! neither handler lets an error escape: the return yields a page outcome,
//! the IPN yields the `{RspCode, Message}` acknowledgement the gateway expects.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::booking::{BookingService, CompletionResult};
use super::vnpay::{VnPay, VnPayParams, VnPayResponse};
use crate::clock::Clock;
use crate::error::{BookingError, BookingResult};
use crate::models::{Caller, Invoice, InvoiceStatus};
use crate::store::BookingStore;

pub const IPN_CONFIRMED: &str = "00";
pub const IPN_FAILED: &str = "97";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReturnOutcome {
    Success { invoice_id: String },
    Failed { invoice_id: Option<String>, reason: String },
}

impl ReturnOutcome {
    fn failed(invoice_id: Option<&str>, reason: impl Into<String>) -> Self {
        ReturnOutcome::Failed {
            invoice_id: invoice_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReturnOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpnResponse {
    #[serde(rename = "RspCode")]
    pub rsp_code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl IpnResponse {
    fn confirmed(message: &str) -> Self {
        Self { rsp_code: IPN_CONFIRMED.to_string(), message: message.to_string() }
    }

    fn failed(message: &str) -> Self {
        Self { rsp_code: IPN_FAILED.to_string(), message: message.to_string() }
    }
}

/// Why a signed gateway result could not be applied.
enum Rejection {
    UnknownInvoice,
    AmountMismatch,
    WrongState(InvoiceStatus),
    Unfunded(String),
    Fault(BookingError),
}

impl From<BookingError> for Rejection {
    fn from(e: BookingError) -> Self {
        match e {
            BookingError::NotFound(_) => Rejection::UnknownInvoice,
            other => Rejection::Fault(other),
        }
    }
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn BookingStore>,
    booking: BookingService,
    vnpay: VnPay,
    clock: Arc<dyn Clock>,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        booking: BookingService,
        vnpay: VnPay,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, booking, vnpay, clock }
    }

    /// Signed gateway URL for an unpaid invoice owned by the caller.
    pub async fn initiate_payment(&self, invoice_id: &str, caller: &Caller, client_ip: &str) -> BookingResult<String> {
        let invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or_else(|| BookingError::not_found(format!("Invoice {} not found", invoice_id)))?;
        if invoice.account_id != caller.account_id {
            return Err(BookingError::unauthorized("You do not own this invoice"));
        }
        if invoice.status != InvoiceStatus::Incomplete {
            return Err(BookingError::conflict(format!(
                "Invoice {} is {} and cannot be paid",
                invoice.id, invoice.status
            )));
        }

        let url = self.vnpay.create_payment_url(
            invoice.total_price,
            &format!("Payment for invoice {}", invoice.id),
            &invoice.id,
            client_ip,
            self.clock.now(),
        );
        info!(invoice_id = %invoice.id, amount = invoice.total_price, "payment initiated");
        Ok(url)
    }

    /// Browser return from the gateway. A success here completes the invoice
    /// exactly like the IPN would.
    pub async fn handle_return(&self, query: Option<&VnPayParams>) -> ReturnOutcome {
        let Some(params) = query else {
            return ReturnOutcome::failed(None, "Missing payment data");
        };
        if !self.vnpay.validate(Some(params)) {
            warn!("payment return with invalid signature");
            return ReturnOutcome::failed(None, "Invalid signature");
        }
        let Some(response) = VnPayResponse::from_params(params) else {
            return ReturnOutcome::failed(None, "Malformed payment data");
        };
        let invoice_id = response.txn_ref.as_str();
        if !response.is_success() {
            info!(invoice_id, code = %response.response_code, "payment declined by gateway");
            return ReturnOutcome::failed(
                Some(invoice_id),
                format!("Payment was not successful (code {})", response.response_code),
            );
        }

        match self.apply_success(&response).await {
            Ok(_) => ReturnOutcome::Success { invoice_id: invoice_id.to_string() },
            Err(Rejection::UnknownInvoice) => ReturnOutcome::failed(Some(invoice_id), "Invoice not found"),
            Err(Rejection::AmountMismatch) => ReturnOutcome::failed(Some(invoice_id), "Amount mismatch"),
            Err(Rejection::WrongState(status)) => {
                ReturnOutcome::failed(Some(invoice_id), format!("Invoice is {}", status))
            }
            Err(Rejection::Unfunded(reason)) => ReturnOutcome::failed(Some(invoice_id), reason),
            Err(Rejection::Fault(e)) => {
                error!(invoice_id, "payment return failed: {:?}", e);
                ReturnOutcome::failed(Some(invoice_id), "Payment could not be recorded")
            }
        }
    }

    /// Server-to-server notification. Answers "00" once the result is recorded
    /// (including repeats) and "97" for anything that could not be applied.
    pub async fn handle_ipn(&self, query: Option<&VnPayParams>) -> IpnResponse {
        let Some(params) = query.filter(|q| !q.is_empty()) else {
            return IpnResponse::failed("Input data required");
        };
        if !self.vnpay.validate(Some(params)) {
            warn!("IPN with invalid signature");
            return IpnResponse::failed("Invalid signature");
        }
        let Some(response) = VnPayResponse::from_params(params) else {
            return IpnResponse::failed("Invalid input data");
        };

        if !response.is_success() {
            return match self.booking.abandon_invoice(&response.txn_ref, "vnpay").await {
                Ok(_) => {
                    info!(invoice_id = %response.txn_ref, code = %response.response_code, "IPN recorded payment failure");
                    IpnResponse::confirmed("Confirm Success")
                }
                Err(BookingError::NotFound(_)) => IpnResponse::failed("Order not found"),
                Err(e) => {
                    error!(invoice_id = %response.txn_ref, "IPN failure handling failed: {:?}", e);
                    IpnResponse::failed("Unknown error")
                }
            };
        }

        match self.apply_success(&response).await {
            Ok(CompletionResult::AlreadyCompleted(_)) => IpnResponse::confirmed("Order already confirmed"),
            Ok(_) => IpnResponse::confirmed("Confirm Success"),
            Err(Rejection::UnknownInvoice) => IpnResponse::failed("Order not found"),
            Err(Rejection::AmountMismatch) => IpnResponse::failed("Invalid amount"),
            Err(Rejection::WrongState(_)) => IpnResponse::failed("Order is no longer payable"),
            Err(Rejection::Unfunded(_)) => IpnResponse::failed("Order discount no longer available"),
            Err(Rejection::Fault(e)) => {
                error!(invoice_id = %response.txn_ref, "IPN processing failed: {:?}", e);
                IpnResponse::failed("Unknown error")
            }
        }
    }

    async fn apply_success(&self, response: &VnPayResponse) -> Result<CompletionResult, Rejection> {
        let invoice: Invoice = self
            .store
            .invoice(&response.txn_ref)
            .await
            .map_err(|e| Rejection::Fault(e.into()))?
            .ok_or(Rejection::UnknownInvoice)?;
        if invoice.total_price != response.amount {
            warn!(
                invoice_id = %invoice.id,
                expected = invoice.total_price,
                received = response.amount,
                "gateway amount does not match invoice"
            );
            return Err(Rejection::AmountMismatch);
        }

        match self
            .booking
            .complete_payment(&invoice.id, response.transaction_no.clone())
            .await?
        {
            CompletionResult::InvalidState(status) => Err(Rejection::WrongState(status)),
            CompletionResult::Unfunded(reason) => Err(Rejection::Unfunded(reason)),
            done => Ok(done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VnPayConfig;
    use crate::models::ScheduleSeatStatus;
    use crate::services::booking::Checkout;
    use crate::services::fixtures::{seeded, Fixture, SHOW_ID};
    use crate::services::schedule::ShowSchedule;
    use crate::services::vnpay::append_signature;
    use chrono::Duration;

    const SECRET: &str = "IPNSECRET";

    fn vnpay() -> VnPay {
        VnPay::new(VnPayConfig {
            tmn_code: "TMN01".to_string(),
            hash_secret: SECRET.to_string(),
            payment_url: "https://pay.example/vpcpay.html".to_string(),
            return_url: "http://localhost/return".to_string(),
            version: "2.1.0".to_string(),
            locale: "vn".to_string(),
            expire_minutes: 15,
        })
    }

    struct World {
        fx: Fixture,
        payments: PaymentService,
        invoice: Invoice,
    }

    async fn world() -> World {
        let fx = seeded();
        let schedule = ShowSchedule::new(fx.store.clone(), fx.clock.clone(), Duration::minutes(10));
        let booking = BookingService::new(fx.store.clone(), fx.clock.clone(), fx.notifier.clone());
        schedule.hold_seats(SHOW_ID, &[1, 2], "alice").await.unwrap();
        let invoice = booking
            .create_invoice(
                &Caller::member("alice"),
                Checkout { show_id: SHOW_ID, seat_ids: vec![1, 2], ..Checkout::default() },
            )
            .await
            .unwrap();
        let payments = PaymentService::new(fx.store.clone(), booking, vnpay(), fx.clock.clone());
        World { fx, payments, invoice }
    }

    fn callback(invoice: &Invoice, amount: i64, code: &str) -> VnPayParams {
        let mut params: VnPayParams = [
            ("vnp_TxnRef", invoice.id.clone()),
            ("vnp_Amount", (amount * 100).to_string()),
            ("vnp_ResponseCode", code.to_string()),
            ("vnp_TransactionStatus", code.to_string()),
            ("vnp_TransactionNo", "14000001".to_string()),
            ("vnp_TmnCode", "TMN01".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        append_signature(&mut params, SECRET);
        params
    }

    #[tokio::test]
    async fn initiate_is_owner_only() {
        let w = world().await;
        let url = w
            .payments
            .initiate_payment(&w.invoice.id, &Caller::member("alice"), "10.0.0.1")
            .await
            .unwrap();
        assert!(url.starts_with("https://pay.example/vpcpay.html?"));
        assert!(url.contains(&format!("vnp_Amount={}", w.invoice.total_price * 100)));

        let err = w
            .payments
            .initiate_payment(&w.invoice.id, &Caller::member("bob"), "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn return_without_data_touches_nothing() {
        let w = world().await;
        let outcome = w.payments.handle_return(None).await;
        assert!(!outcome.is_success());
        let stored = w.fx.store.invoice(&w.invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Incomplete);
    }

    #[tokio::test]
    async fn successful_return_completes_once() {
        let w = world().await;
        let params = callback(&w.invoice, w.invoice.total_price, "00");

        assert!(w.payments.handle_return(Some(&params)).await.is_success());
        assert!(w.payments.handle_return(Some(&params)).await.is_success());
        let stored = w.fx.store.invoice(&w.invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Completed);
        assert_eq!(stored.payment_ref.as_deref(), Some("14000001"));
        assert_eq!(w.fx.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn return_failures() {
        let w = world().await;
        let mut tampered = callback(&w.invoice, w.invoice.total_price, "00");
        tampered.insert("vnp_Amount".to_string(), "1".to_string());
        assert!(!w.payments.handle_return(Some(&tampered)).await.is_success());

        let declined = callback(&w.invoice, w.invoice.total_price, "24");
        assert!(!w.payments.handle_return(Some(&declined)).await.is_success());

        let mut ghost = w.invoice.clone();
        ghost.id = "INVGHOST".to_string();
        let outcome = w.payments.handle_return(Some(&callback(&ghost, 1, "00"))).await;
        assert_eq!(
            outcome,
            ReturnOutcome::Failed { invoice_id: Some("INVGHOST".to_string()), reason: "Invoice not found".to_string() }
        );
        let stored = w.fx.store.invoice(&w.invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Incomplete);
    }

    #[tokio::test]
    async fn ipn_is_idempotent() {
        let w = world().await;
        let params = callback(&w.invoice, w.invoice.total_price, "00");
        let first = w.payments.handle_ipn(Some(&params)).await;
        assert_eq!(first.rsp_code, IPN_CONFIRMED);
        let second = w.payments.handle_ipn(Some(&params)).await;
        assert_eq!(second.rsp_code, IPN_CONFIRMED);

        let account = w.fx.store.account("alice").await.unwrap().unwrap();
        assert_eq!(account.score, 50_000 + w.invoice.total_price / 10);
    }

    #[tokio::test]
    async fn ipn_rejections_answer_97() {
        let w = world().await;
        assert_eq!(w.payments.handle_ipn(None).await.rsp_code, IPN_FAILED);
        assert_eq!(w.payments.handle_ipn(Some(&VnPayParams::new())).await.rsp_code, IPN_FAILED);

        let mut forged = callback(&w.invoice, w.invoice.total_price, "00");
        forged.insert("vnp_SecureHash".to_string(), "00ff".to_string());
        assert_eq!(w.payments.handle_ipn(Some(&forged)).await.rsp_code, IPN_FAILED);

        let short = callback(&w.invoice, w.invoice.total_price - 1, "00");
        let response = w.payments.handle_ipn(Some(&short)).await;
        assert_eq!(response, IpnResponse::failed("Invalid amount"));

        let mut fractional = callback(&w.invoice, w.invoice.total_price, "00");
        fractional.insert("vnp_Amount".to_string(), (w.invoice.total_price * 100 + 50).to_string());
        append_signature(&mut fractional, SECRET);
        let response = w.payments.handle_ipn(Some(&fractional)).await;
        assert_eq!(response, IpnResponse::failed("Invalid input data"));

        let stored = w.fx.store.invoice(&w.invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Incomplete);
    }

    #[tokio::test]
    async fn ipn_refuses_invoice_whose_voucher_was_spent() {
        let fx = seeded();
        let schedule = ShowSchedule::new(fx.store.clone(), fx.clock.clone(), Duration::minutes(10));
        let booking = BookingService::new(fx.store.clone(), fx.clock.clone(), fx.notifier.clone());
        let alice = Caller::member("alice");
        schedule.hold_seats(SHOW_ID, &[1, 2], "alice").await.unwrap();
        let with_voucher = |seat| Checkout {
            show_id: SHOW_ID,
            seat_ids: vec![seat],
            voucher_id: Some("V1".to_string()),
            ..Checkout::default()
        };
        let first = booking.create_invoice(&alice, with_voucher(1)).await.unwrap();
        let second = booking.create_invoice(&alice, with_voucher(2)).await.unwrap();
        let payments = PaymentService::new(fx.store.clone(), booking, vnpay(), fx.clock.clone());

        let paid = payments.handle_ipn(Some(&callback(&first, first.total_price, "00"))).await;
        assert_eq!(paid.rsp_code, IPN_CONFIRMED);
        let score = fx.store.account("alice").await.unwrap().unwrap().score;

        let refused = payments.handle_ipn(Some(&callback(&second, second.total_price, "00"))).await;
        assert_eq!(refused, IpnResponse::failed("Order discount no longer available"));
        let stored = fx.store.invoice(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Incomplete);
        assert_eq!(fx.store.account("alice").await.unwrap().unwrap().score, score);

        let outcome = payments.handle_return(Some(&callback(&second, second.total_price, "00"))).await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn declined_ipn_cancels_and_frees_seats() {
        let w = world().await;
        let declined = callback(&w.invoice, w.invoice.total_price, "24");
        let response = w.payments.handle_ipn(Some(&declined)).await;
        assert_eq!(response.rsp_code, IPN_CONFIRMED);

        let stored = w.fx.store.invoice(&w.invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Cancelled);
        let seats = w.fx.store.schedule_seats(SHOW_ID).await.unwrap();
        assert!(seats.iter().all(|s| s.status == ScheduleSeatStatus::Available));

        let late_success = callback(&w.invoice, w.invoice.total_price, "00");
        assert_eq!(w.payments.handle_ipn(Some(&late_success)).await.rsp_code, IPN_FAILED);
    }
}
