//! Fixtures shared by the unit tests of this crate.

use holdfast_core::sandbox::SandboxProvider;
use holdfast_core::{FeeSchedule, MemoryKeyValueStore, PaymentProvider, PayoutAccount, ProviderKind};
use holdfast_shared::Masked;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::disbursement::{CoordinatorSettings, DisbursementCoordinator};
use crate::lifecycle::{LifecycleEngine, NewOrder};
use crate::locks::OrderLocks;
use crate::models::{Customer, OrderAggregate, ProductDetails};
use crate::repository::MemoryOrderRepository;

pub struct Harness {
    pub engine: Arc<LifecycleEngine>,
    pub paystack: Arc<SandboxProvider>,
    pub korapay: Arc<SandboxProvider>,
    pub repo: Arc<MemoryOrderRepository>,
}

pub fn seller_account() -> PayoutAccount {
    PayoutAccount {
        account_name: "Kemi Stores".into(),
        account_number: Masked("0690000031".to_string()),
        bank_code: "044".into(),
        email: Masked("sales@kemi.test".to_string()),
        recipient_code: Some("RCP_kemi".into()),
    }
}

pub fn new_order(amount: Decimal) -> NewOrder {
    NewOrder {
        merchant_id: "merchant-1".into(),
        customer: Customer {
            first_name: "Ada".into(),
            last_name: "Obi".into(),
            email: Masked("Ada@Example.com".to_string()),
            phone: Masked("+2348000000000".to_string()),
            country: "NG".into(),
            city: "Lagos".into(),
            address: "12 Marina".into(),
            refund_account: None,
        },
        product: ProductDetails {
            name: "Standing desk".into(),
            category: Some("furniture".into()),
            description: None,
            metadata: None,
        },
        product_amount: amount,
        seller_account: seller_account(),
        partial_disbursement: None,
        delivery_days: 5,
        inspection_days: 7,
    }
}

/// An aggregate built without the engine, for repository and ledger tests.
pub fn sample_aggregate() -> OrderAggregate {
    use crate::models::*;
    let now = chrono::Utc::now();
    let product_amount = Decimal::from(80_000);
    let order = Order {
        id: uuid::Uuid::new_v4(),
        reference: uuid::Uuid::new_v4().simple().to_string()[..21].to_string(),
        merchant_id: "merchant-1".into(),
        customer: new_order(product_amount).customer,
        product: new_order(product_amount).product,
        seller_account: seller_account(),
        amounts: OrderAmounts {
            product_amount,
            escrow_fee: Decimal::from(2080),
            process_fee: Decimal::from(1000),
            escrow_percent: Decimal::new(26, 1),
            amount_to_pay: Decimal::from(83_080),
            amount_paid: Decimal::ZERO,
            amount_to_balance: Decimal::from(83_080),
            amount_overflow: Decimal::ZERO,
            current_holdings: Decimal::ZERO,
            amount_to_partially_disburse: Decimal::ZERO,
            amount_partially_disbursed: Decimal::ZERO,
            amount_remaining_to_be_disbursed: product_amount,
            total_amount_disbursed: Decimal::ZERO,
            amount_refunded: Decimal::ZERO,
        },
        payment: PaymentPhase::default(),
        delivery: DeliveryPhase { delivery_days: 5, ..Default::default() },
        inspection: InspectionPhase { inspection_days: 7, ..Default::default() },
        dispute: DisputePhase::None,
        disbursement: DisbursementPhase::default(),
        special_attention: None,
        closure: None,
        created_at: now,
        updated_at: now,
    };
    OrderAggregate::new(order)
}

pub fn engine() -> Harness {
    let paystack = Arc::new(SandboxProvider::new(ProviderKind::Paystack, "pk-secret"));
    let korapay = Arc::new(SandboxProvider::new(ProviderKind::Korapay, "kora-secret"));
    paystack.register_account("0123456789", "058", "ADA OBI");
    let repo = Arc::new(MemoryOrderRepository::new());
    let (events, _) = broadcast::channel(64);
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

    let engine = Arc::new(LifecycleEngine::new(repo.clone(), Arc::new(coordinator), FeeSchedule::standard()));
    Harness { engine, paystack, korapay, repo }
}
