//! End-to-end order flows against sandbox providers and in-memory stores.

use holdfast_core::sandbox::SandboxProvider;
use holdfast_core::{FeeSchedule, MemoryKeyValueStore, PaymentProvider, PayoutAccount, ProviderKind};
use holdfast_order::disbursement::{CoordinatorSettings, DisbursementCoordinator, ReconcileOutcome};
use holdfast_order::models::{ClosureReason, ConditionDraft, Customer, ProductDetails, ReturnDelivery};
use holdfast_order::timeline::TimelineCategory;
use holdfast_order::{
    DisputeConclusion, DisputeDraft, EscrowError, LifecycleEngine, MemoryOrderRepository, NewOrder, OrderLocks,
};
use holdfast_shared::models::events::TransferKind;
use holdfast_shared::{EscrowEvent, Masked};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::broadcast;

struct World {
    engine: Arc<LifecycleEngine>,
    paystack: Arc<SandboxProvider>,
    korapay: Arc<SandboxProvider>,
}

fn world() -> World {
    let paystack = Arc::new(SandboxProvider::new(ProviderKind::Paystack, "pk-secret"));
    let korapay = Arc::new(SandboxProvider::new(ProviderKind::Korapay, "kora-secret"));
    let repo = Arc::new(MemoryOrderRepository::new());
    let (events, _) = broadcast::channel(128);
    let ranking: Vec<Arc<dyn PaymentProvider>> = vec![paystack.clone(), korapay.clone()];
    let coordinator = DisbursementCoordinator::new(
        ranking,
        Arc::new(MemoryKeyValueStore::new()),
        repo.clone(),
        Arc::new(OrderLocks::default()),
        events,
        CoordinatorSettings::default(),
    )
    .with_verifier(ProviderKind::Paystack, paystack.verifier().clone())
    .with_verifier(ProviderKind::Korapay, korapay.verifier().clone());
    let engine = Arc::new(LifecycleEngine::new(repo, Arc::new(coordinator), FeeSchedule::standard()));
    World { engine, paystack, korapay }
}

fn order(amount: Decimal) -> NewOrder {
    NewOrder {
        merchant_id: "merchant-42".into(),
        customer: Customer {
            first_name: "Tunde".into(),
            last_name: "Bello".into(),
            email: Masked("tunde@example.com".to_string()),
            phone: Masked("+2348011111111".to_string()),
            country: "NG".into(),
            city: "Abuja".into(),
            address: "3 Wuse Close".into(),
            refund_account: None,
        },
        product: ProductDetails {
            name: "Laptop".into(),
            category: Some("electronics".into()),
            description: Some("14 inch, 16GB".into()),
            metadata: None,
        },
        product_amount: amount,
        seller_account: PayoutAccount {
            account_name: "Gadget Hub".into(),
            account_number: Masked("0690000032".to_string()),
            bank_code: "044".into(),
            email: Masked("payouts@gadgethub.test".to_string()),
            recipient_code: None,
        },
        partial_disbursement: None,
        delivery_days: 3,
        inspection_days: 2,
    }
}

fn conditions() -> Vec<ConditionDraft> {
    vec![
        ConditionDraft { title: "Boots".into(), description: "Reaches the desktop".into(), partial_disburse_requisite: false },
        ConditionDraft { title: "Battery".into(), description: "Holds 4 hours".into(), partial_disburse_requisite: false },
    ]
}

async fn paid_and_delivered(w: &World, amount: Decimal) -> String {
    let agg = w.engine.initialize_order(order(amount)).await.unwrap();
    let reference = agg.reference().to_string();
    w.engine.set_conditions(&reference, conditions()).await.unwrap();
    let session = w.engine.initiate_payment(&reference).await.unwrap();
    w.paystack.settle_charge(&session.provider_ref, session.amount);
    let receipt = w.engine.verify_payment(&reference, &session.provider_ref).await.unwrap();
    assert!(receipt.fully_paid);
    w.engine.confirm_sent_out(&reference).await.unwrap();
    w.engine.seller_confirm_delivery(&reference).await.unwrap();
    w.engine.buyer_confirm_delivery(&reference).await.unwrap();
    reference
}

#[tokio::test]
async fn test_happy_path_pays_seller_and_closes() {
    let w = world();
    let mut events = w.engine.subscribe();

    let quote = w.engine.quote(dec!(80000)).unwrap();
    assert_eq!(quote.escrow_fee, dec!(2080));
    assert_eq!(quote.process_fee, dec!(1000));
    assert_eq!(quote.escrow_percent, dec!(2.6));

    let reference = paid_and_delivered(&w, dec!(80000)).await;
    let stored = w.engine.get_order(&reference).await.unwrap();
    assert_eq!(stored.order.amounts.amount_to_pay, dec!(83080));
    assert_eq!(stored.order.amounts.current_holdings, dec!(83080));

    w.engine.mark_all_conditions_met(&reference).await.unwrap();
    w.engine.verify_conditions_met(&reference).await.unwrap();
    w.engine.approve_seller_disbursement(&reference).await.unwrap();
    let handle = w.engine.initiate_seller_payout(&reference).await.unwrap();
    assert_eq!(handle.kind, TransferKind::Full);
    assert_eq!(handle.provider, ProviderKind::Paystack);
    assert_eq!(handle.amount, dec!(80000));
    assert!(handle.reference.starts_with("pk_trans_full_"));

    let stored = w.engine.get_order(&reference).await.unwrap();
    assert!(stored.order.disbursement.full.processing());
    assert!(!stored.order.is_closed());

    let (body, sig) = w.paystack.signed_webhook("transfer.success", &handle.reference, dec!(80000)).unwrap();
    let outcome = w.engine.coordinator().reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { kind: TransferKind::Full, .. }));

    let stored = w.engine.get_order(&reference).await.unwrap();
    let a = &stored.order.amounts;
    assert!(stored.order.disbursement.full.dispatched());
    assert_eq!(a.total_amount_disbursed, dec!(80000));
    assert_eq!(a.amount_remaining_to_be_disbursed, dec!(0));
    assert_eq!(a.current_holdings, dec!(3080));
    assert_eq!(stored.order.closure.as_ref().map(|c| c.reason), Some(ClosureReason::SellerPaid));
    assert_eq!(stored.history.len(), 2);
    assert_eq!(stored.timeline.count(TimelineCategory::DisbursementVerification), 1);

    let mut saw_close = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EscrowEvent::OrderClosed { .. }) {
            saw_close = true;
        }
    }
    assert!(saw_close);

    w.engine.rate_order(&reference, 5, Some("as described".into())).await.unwrap();
}

#[tokio::test]
async fn test_rejected_dispute_refunds_buyer() {
    let w = world();
    w.paystack.register_account("0123456789", "058", "TUNDE BELLO");
    let reference = paid_and_delivered(&w, dec!(80000)).await;
    let condition = w.engine.conditions(&reference).await.unwrap()[1].id;

    let dispute = w
        .engine
        .raise_dispute(
            &reference,
            DisputeDraft { title: "Battery".into(), reason: "Dies after 20 minutes".into(), condition_id: Some(condition) },
        )
        .await
        .unwrap();
    assert!(matches!(
        w.engine.mark_condition_met(&reference, condition).await,
        Err(EscrowError::PreconditionNotMet(_))
    ));
    assert!(matches!(
        w.engine.approve_seller_disbursement(&reference).await,
        Err(EscrowError::PreconditionNotMet(_))
    ));

    w.engine.resolve_dispute(&reference, dispute.id).await.unwrap();
    w.engine
        .conclude_dispute(&reference, DisputeConclusion::Rejected { return_window_days: 5 })
        .await
        .unwrap();
    w.engine
        .confirm_return_sent_out(
            &reference,
            ReturnDelivery {
                courier: "DHL".into(),
                tracking_number: "DHL-778".into(),
                source: "Abuja".into(),
                destination: "Lagos".into(),
                instructions: Some("fragile".into()),
            },
        )
        .await
        .unwrap();
    w.engine.buyer_confirm_return(&reference).await.unwrap();
    w.engine.seller_confirm_return(&reference).await.unwrap();
    w.engine.accept_return_condition(&reference).await.unwrap();

    assert!(matches!(
        w.engine.initiate_refund(&reference).await,
        Err(EscrowError::PreconditionNotMet(_))
    ));
    w.engine.register_refund_account(&reference, "0123456789", "058").await.unwrap();
    let handle = w.engine.initiate_refund(&reference).await.unwrap();
    assert_eq!(handle.kind, TransferKind::Refund);
    assert_eq!(handle.amount, dec!(80000));
    assert!(handle.reference.starts_with("pk_refund_"));

    let (body, sig) = w.paystack.signed_webhook("transfer.success", &handle.reference, dec!(80000)).unwrap();
    w.engine.coordinator().reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();

    let stored = w.engine.get_order(&reference).await.unwrap();
    assert!(stored.order.disbursement.refund.dispatched());
    assert!(!stored.order.disbursement.full.initiated());
    assert_eq!(stored.order.amounts.amount_refunded, dec!(80000));
    assert_eq!(stored.order.closure.as_ref().map(|c| c.reason), Some(ClosureReason::Refunded));
}

#[tokio::test]
async fn test_webhook_replay_applies_once() {
    let w = world();
    let reference = paid_and_delivered(&w, dec!(20000)).await;
    w.engine.mark_all_conditions_met(&reference).await.unwrap();
    w.engine.approve_seller_disbursement(&reference).await.unwrap();
    let handle = w.engine.initiate_seller_payout(&reference).await.unwrap();

    let (body, sig) = w.paystack.signed_webhook("transfer.success", &handle.reference, dec!(20000)).unwrap();
    let coordinator = w.engine.coordinator().clone();
    let (first, second) = tokio::join!(
        coordinator.reconcile(ProviderKind::Paystack, &body, &sig),
        coordinator.reconcile(ProviderKind::Paystack, &body, &sig),
    );
    let applied = [first.unwrap(), second.unwrap()]
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1);

    let third = coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await.unwrap();
    assert_eq!(third, ReconcileOutcome::Ignored);

    let stored = w.engine.get_order(&reference).await.unwrap();
    let payouts = stored.history.iter().filter(|r| r.reference == handle.reference).count();
    assert_eq!(payouts, 1);
    assert_eq!(stored.order.amounts.total_amount_disbursed, dec!(20000));
}

#[tokio::test]
async fn test_primary_outage_falls_back() {
    let w = world();
    let reference = paid_and_delivered(&w, dec!(20000)).await;
    w.engine.mark_all_conditions_met(&reference).await.unwrap();
    w.engine.approve_seller_disbursement(&reference).await.unwrap();

    w.paystack.fail_payouts(true);
    let handle = w.engine.initiate_seller_payout(&reference).await.unwrap();
    assert_eq!(handle.provider, ProviderKind::Korapay);
    assert!(handle.reference.starts_with("k_trans_full_"));
    assert_eq!(w.korapay.payouts().len(), 1);

    let (body, sig) = w.korapay.signed_webhook("transfer.success", &handle.reference, dec!(20000)).unwrap();
    assert!(matches!(
        w.engine.coordinator().reconcile(ProviderKind::Paystack, &body, &sig).await,
        Err(EscrowError::InvalidSignature)
    ));
    w.engine.coordinator().reconcile(ProviderKind::Korapay, &body, &sig).await.unwrap();
    assert!(w.engine.get_order(&reference).await.unwrap().order.is_closed());
}

#[tokio::test]
async fn test_total_outage_leaves_order_retryable() {
    let w = world();
    let reference = paid_and_delivered(&w, dec!(20000)).await;
    w.engine.mark_all_conditions_met(&reference).await.unwrap();
    w.engine.approve_seller_disbursement(&reference).await.unwrap();

    w.paystack.fail_payouts(true);
    w.korapay.fail_payouts(true);
    assert!(matches!(
        w.engine.initiate_seller_payout(&reference).await,
        Err(EscrowError::ProviderFailure(_))
    ));
    let stored = w.engine.get_order(&reference).await.unwrap();
    assert!(!stored.order.disbursement.full.initiated());

    w.paystack.fail_payouts(false);
    let handle = w.engine.initiate_seller_payout(&reference).await.unwrap();
    assert_eq!(handle.provider, ProviderKind::Paystack);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_webhooks_for_one_order_apply_once() {
    let w = world();
    let reference = paid_and_delivered(&w, dec!(30000)).await;
    w.engine.mark_all_conditions_met(&reference).await.unwrap();
    w.engine.approve_seller_disbursement(&reference).await.unwrap();
    let handle = w.engine.initiate_seller_payout(&reference).await.unwrap();
    let before = w.engine.get_order(&reference).await.unwrap();

    let (body, sig) = w.paystack.signed_webhook("transfer.success", &handle.reference, dec!(30000)).unwrap();
    let deliveries: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = w.engine.coordinator().clone();
            let (body, sig) = (body.clone(), sig.clone());
            tokio::spawn(async move { coordinator.reconcile(ProviderKind::Paystack, &body, &sig).await })
        })
        .collect();

    let mut applied = 0;
    for delivery in deliveries {
        if let ReconcileOutcome::Applied { .. } = delivery.await.unwrap().unwrap() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let stored = w.engine.get_order(&reference).await.unwrap();
    assert_eq!(stored.history.iter().filter(|r| r.reference == handle.reference).count(), 1);
    assert_eq!(stored.order.amounts.total_amount_disbursed, dec!(30000));
    assert_eq!(stored.order.amounts.amount_remaining_to_be_disbursed, Decimal::ZERO);
    assert_eq!(
        stored.order.amounts.current_holdings,
        before.order.amounts.current_holdings - dec!(30000)
    );
    assert!(stored.order.disbursement.full.dispatched());
    assert!(stored.order.is_closed());
}
