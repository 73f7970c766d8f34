//! Integration tests for orders and payments.
//!
//! These tests drive the services against the in-memory store and verify the
//! order lifecycle, stock movement, payment rules and atomicity of each write.

use common::{Money, OrderId, ProductId, UserId};
use domain::{
    AddOrderItem, DeliveryAddress, DomainError, ErrorKind, Order, OrderError, OrderLine,
    OrderService, OrderStatus, PaymentError, PaymentMethod, PaymentService, PaymentStatus,
    PlaceOrder, Product, ProductError, RemoveOrderItem, StockLedger, UpdateOrderItemQuantity,
    specifications,
};
use store::{CancellationToken, Entity, InMemoryStore, StoreError, UnitOfWork};

struct Services {
    store: InMemoryStore,
    ledger: StockLedger<InMemoryStore>,
    orders: OrderService<InMemoryStore>,
    payments: PaymentService<InMemoryStore>,
}

/// Helper to create the services over one shared store
fn create_services() -> Services {
    let store = InMemoryStore::new();
    Services {
        ledger: StockLedger::new(store.clone()),
        orders: OrderService::new(store.clone()),
        payments: PaymentService::new(store.clone()),
        store,
    }
}

fn address() -> DeliveryAddress {
    DeliveryAddress::new("1 Main St", "Springfield", "12345", "US").unwrap()
}

async fn seed_product(services: &Services, name: &str, cents: i64, stock: i64) -> Product {
    services
        .ledger
        .create_product(
            Product::new(name, "", Money::from_cents(cents), stock).unwrap(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
}

async fn stock_of(services: &Services, product_id: ProductId) -> i64 {
    services
        .ledger
        .get_product(product_id, &CancellationToken::new())
        .await
        .unwrap()
        .stock_quantity()
}

async fn place(services: &Services, lines: &[(&Product, u32)]) -> Order {
    let lines = lines
        .iter()
        .map(|(product, quantity)| OrderLine::new(product.id(), *quantity))
        .collect();
    services
        .orders
        .place_order(
            PlaceOrder::new(UserId::new(7), address(), lines),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
}

/// Places an order and settles it in full by credit card.
async fn paid_order(services: &Services, lines: &[(&Product, u32)]) -> Order {
    let cancel = CancellationToken::new();
    let order = place(services, lines).await;
    let payment = services
        .payments
        .create_for_order(order.id(), PaymentMethod::CreditCard, &cancel)
        .await
        .unwrap();
    services
        .payments
        .complete(payment.id(), order.total_amount(), &cancel)
        .await
        .unwrap();
    order
}

mod order_lifecycle {
    use super::*;

    #[tokio::test]
    async fn complete_order_lifecycle() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let gadget = seed_product(&services, "Gadget", 250, 10).await;

        // Place order
        let order = place(&services, &[(&widget, 2), (&gadget, 4)]).await;
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.total_amount().cents(), 3000);
        assert_eq!(stock_of(&services, widget.id()).await, 8);
        assert_eq!(stock_of(&services, gadget.id()).await, 6);

        // Pay
        let payment = services
            .payments
            .create_for_order(order.id(), PaymentMethod::CreditCard, &cancel)
            .await
            .unwrap();
        assert_eq!(payment.amount_to_pay().cents(), 3000);
        assert_eq!(payment.status(), PaymentStatus::Pending);

        let payment = services
            .payments
            .complete(payment.id(), Money::from_cents(3000), &cancel)
            .await
            .unwrap();
        assert!(payment.is_succeeded());
        assert_eq!(payment.cash_change(), None);

        // Walk the state machine
        let order = services.orders.confirm(order.id(), &cancel).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Placed);
        assert_eq!(order.payment_id(), Some(payment.id()));

        let order = services.orders.process(order.id(), &cancel).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Processing);

        let order = services.orders.ship(order.id(), &cancel).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Shipped);

        let order = services.orders.deliver(order.id(), &cancel).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Delivered);

        // Stock was only taken once, at placement
        assert_eq!(stock_of(&services, widget.id()).await, 8);
        assert_eq!(stock_of(&services, gadget.id()).await, 6);
    }

    #[tokio::test]
    async fn reloaded_order_matches_what_was_placed() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let gadget = seed_product(&services, "Gadget", 250, 10).await;

        let placed = place(&services, &[(&widget, 2), (&gadget, 4)]).await;
        let loaded = services.orders.get_order(placed.id(), &cancel).await.unwrap();

        let lines = |order: &Order| {
            let mut lines: Vec<_> = order
                .items()
                .iter()
                .map(|i| (i.product_id(), i.quantity(), i.unit_price()))
                .collect();
            lines.sort();
            lines
        };
        assert_eq!(lines(&loaded), lines(&placed));
        assert_eq!(lines(&loaded).len(), 2);
        assert_eq!(loaded.total_amount(), placed.total_amount());
        assert_eq!(loaded.delivery_address(), &address());

        // Products come attached on the read-only load
        for item in loaded.items() {
            let product = item.product().expect("product attached");
            assert_eq!(product.id, item.product_id());
        }

        // The tracked load used for writes sees the same lines
        let mut uow = UnitOfWork::new(services.store.clone());
        let tracked = uow
            .repository::<Order>()
            .first_or_default(&specifications::order_by_id_with_items(placed.id()), &cancel)
            .await
            .unwrap()
            .expect("order exists");
        assert!(tracked.items_loaded());
        assert_eq!(lines(&tracked), lines(&placed));
        assert_eq!(tracked.total_amount(), placed.total_amount());
        assert!(uow.is_tracked::<Order>(tracked.key()));
        assert!(!uow.has_changes());
    }

    #[tokio::test]
    async fn orders_for_user_lists_summaries() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;

        place(&services, &[(&widget, 1)]).await;
        place(&services, &[(&widget, 2)]).await;

        let summaries = services
            .orders
            .orders_for_user(UserId::new(7), &cancel)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| !s.has_payment));

        let none = services
            .orders
            .orders_for_user(UserId::new(8), &cancel)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let services = create_services();
        let err = services
            .orders
            .get_order(OrderId::new(999), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.code(), 1000);
    }
}

mod item_management {
    use super::*;

    #[tokio::test]
    async fn adding_items_takes_stock() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let gadget = seed_product(&services, "Gadget", 250, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        // Same product merges into the existing line
        let order = services
            .orders
            .add_item(AddOrderItem::new(order.id(), widget.id(), 2), &cancel)
            .await
            .unwrap();
        assert_eq!(order.items().len(), 1);
        assert_eq!(order.items()[0].quantity(), 3);
        assert_eq!(order.total_amount().cents(), 3000);
        assert_eq!(stock_of(&services, widget.id()).await, 7);

        let order = services
            .orders
            .add_item(AddOrderItem::new(order.id(), gadget.id(), 1), &cancel)
            .await
            .unwrap();
        assert_eq!(order.items().len(), 2);
        assert_eq!(order.total_amount().cents(), 3250);
        assert_eq!(stock_of(&services, gadget.id()).await, 9);
    }

    #[tokio::test]
    async fn quantity_overflow_is_rejected_without_touching_stock() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let err = services
            .orders
            .add_item(AddOrderItem::new(order.id(), widget.id(), u32::MAX), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DomainError::Order(OrderError::InvalidQuantity { quantity: u32::MAX })
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(stock_of(&services, widget.id()).await, 9);
        let order = services.orders.get_order(order.id(), &cancel).await.unwrap();
        assert_eq!(order.items()[0].quantity(), 1);
        assert_eq!(order.total_amount().cents(), 1000);
    }

    #[tokio::test]
    async fn removing_an_item_returns_its_stock() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let gadget = seed_product(&services, "Gadget", 250, 10).await;
        let order = place(&services, &[(&widget, 2), (&gadget, 4)]).await;

        let order = services
            .orders
            .remove_item(RemoveOrderItem::new(order.id(), gadget.id()), &cancel)
            .await
            .unwrap();

        assert_eq!(order.items().len(), 1);
        assert_eq!(order.total_amount().cents(), 2000);
        assert_eq!(stock_of(&services, gadget.id()).await, 10);

        let reloaded = services.orders.get_order(order.id(), &cancel).await.unwrap();
        assert_eq!(reloaded.items().len(), 1);
        assert_eq!(reloaded.items()[0].product_id(), widget.id());
    }

    #[tokio::test]
    async fn updating_quantity_moves_stock_both_ways() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 2)]).await;

        let order = services
            .orders
            .update_item_quantity(UpdateOrderItemQuantity::new(order.id(), widget.id(), 5), &cancel)
            .await
            .unwrap();
        assert_eq!(order.total_amount().cents(), 5000);
        assert_eq!(stock_of(&services, widget.id()).await, 5);

        let order = services
            .orders
            .update_item_quantity(UpdateOrderItemQuantity::new(order.id(), widget.id(), 1), &cancel)
            .await
            .unwrap();
        assert_eq!(order.total_amount().cents(), 1000);
        assert_eq!(stock_of(&services, widget.id()).await, 9);
    }

    #[tokio::test]
    async fn adding_beyond_stock_changes_nothing() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 3).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let err = services
            .orders
            .add_item(AddOrderItem::new(order.id(), widget.id(), 5), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DomainError::Product(ProductError::StockQuantityNotAvailable {
                available: 2,
                requested: 5
            })
        ));
        assert_eq!(err.kind(), ErrorKind::InsufficientResource);

        let reloaded = services.orders.get_order(order.id(), &cancel).await.unwrap();
        assert_eq!(reloaded.items()[0].quantity(), 1);
        assert_eq!(reloaded.total_amount().cents(), 1000);
        assert_eq!(stock_of(&services, widget.id()).await, 2);
    }

    #[tokio::test]
    async fn cannot_remove_last_item() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let err = services
            .orders
            .remove_item(RemoveOrderItem::new(order.id(), widget.id()), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Order(OrderError::CannotRemoveLastItem)));
        assert_eq!(stock_of(&services, widget.id()).await, 9);
    }

    #[tokio::test]
    async fn items_are_locked_once_a_payment_exists() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;
        services
            .payments
            .create_for_order(order.id(), PaymentMethod::Cash, &cancel)
            .await
            .unwrap();

        let err = services
            .orders
            .add_item(AddOrderItem::new(order.id(), widget.id(), 1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Order(OrderError::ItemsLocked)));
        assert_eq!(stock_of(&services, widget.id()).await, 9);
    }
}

mod error_handling {
    use super::*;

    #[tokio::test]
    async fn cannot_confirm_without_payment() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let err = services.orders.confirm(order.id(), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::CannotBeConfirmedWithoutPayment)
        ));

        // A pending payment is not enough either
        services
            .payments
            .create_for_order(order.id(), PaymentMethod::CreditCard, &cancel)
            .await
            .unwrap();
        let err = services.orders.confirm(order.id(), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::CannotBeConfirmedWithoutPayment)
        ));
    }

    #[tokio::test]
    async fn confirming_twice_fails() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = paid_order(&services, &[(&widget, 1)]).await;

        services.orders.confirm(order.id(), &cancel).await.unwrap();
        let err = services.orders.confirm(order.id(), &cancel).await.unwrap_err();

        assert!(matches!(err, DomainError::Order(OrderError::AlreadyConfirmed)));
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[tokio::test]
    async fn cannot_ship_after_partial_refund() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = paid_order(&services, &[(&widget, 2)]).await;
        let order = services.orders.confirm(order.id(), &cancel).await.unwrap();
        let payment_id = order.payment_id().unwrap();

        let payment = services
            .payments
            .refund(payment_id, Money::from_cents(500), &cancel)
            .await
            .unwrap();
        assert_eq!(payment.status(), PaymentStatus::PartiallyRefunded);

        let err = services.orders.ship(order.id(), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::CannotBeShippedWithoutPayment)
        ));
    }

    #[tokio::test]
    async fn cannot_deliver_before_shipping() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let err = services.orders.deliver(order.id(), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::InvalidStatusForOperation { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_token_writes_nothing() {
        let services = create_services();
        let widget = seed_product(&services, "Widget", 1000, 10).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = services
            .orders
            .place_order(
                PlaceOrder::new(
                    UserId::new(7),
                    address(),
                    vec![OrderLine::new(widget.id(), 2)],
                ),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Store(StoreError::Cancelled)));
        assert_eq!(err.code(), 1002);
        assert_eq!(services.store.row_count("orders").await, 0);
        assert_eq!(stock_of(&services, widget.id()).await, 10);
    }

    #[tokio::test]
    async fn placing_with_unknown_product_fails() {
        let services = create_services();
        let err = services
            .orders
            .place_order(
                PlaceOrder::new(
                    UserId::new(7),
                    address(),
                    vec![OrderLine::new(ProductId::new(404), 1)],
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(services.store.row_count("orders").await, 0);
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn cancel_returns_all_stock() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let gadget = seed_product(&services, "Gadget", 250, 10).await;
        let order = place(&services, &[(&widget, 2), (&gadget, 4)]).await;

        let order = services.orders.cancel(order.id(), &cancel).await.unwrap();

        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(stock_of(&services, widget.id()).await, 10);
        assert_eq!(stock_of(&services, gadget.id()).await, 10);

        let err = services.orders.cancel(order.id(), &cancel).await.unwrap_err();
        assert!(matches!(err, DomainError::Order(OrderError::AlreadyCancelled)));
        assert_eq!(stock_of(&services, widget.id()).await, 10);
    }

    #[tokio::test]
    async fn cannot_cancel_shipped_order() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = paid_order(&services, &[(&widget, 1)]).await;
        services.orders.confirm(order.id(), &cancel).await.unwrap();
        services.orders.ship(order.id(), &cancel).await.unwrap();

        let err = services.orders.cancel(order.id(), &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            DomainError::Order(OrderError::CannotCancelShippedOrDelivered)
        ));
        assert_eq!(stock_of(&services, widget.id()).await, 9);
    }

    #[tokio::test]
    async fn cancelled_order_rejects_status_changes() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;
        services.orders.cancel(order.id(), &cancel).await.unwrap();

        let err = services.orders.confirm(order.id(), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::CannotChangeStatusOfACancelledOrder)
        ));
    }

    #[tokio::test]
    async fn refund_returns_stock_and_money() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = paid_order(&services, &[(&widget, 3)]).await;
        services.orders.confirm(order.id(), &cancel).await.unwrap();

        let order = services.orders.refund(order.id(), &cancel).await.unwrap();

        assert_eq!(order.status(), OrderStatus::Refunded);
        assert_eq!(stock_of(&services, widget.id()).await, 10);

        let payment = services
            .payments
            .for_order(order.id(), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status(), PaymentStatus::Refunded);
        assert_eq!(payment.refunded_amount().cents(), 3000);
    }

    #[tokio::test]
    async fn refund_without_payment_fails() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let err = services.orders.refund(order.id(), &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            DomainError::Order(OrderError::CannotBeRefundedWithoutPayment)
        ));
        assert_eq!(stock_of(&services, widget.id()).await, 9);
    }
}

mod payments {
    use super::*;

    #[tokio::test]
    async fn cash_payment_requires_full_amount_and_gives_change() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let product = seed_product(&services, "Lamp", 10_000, 5).await;
        let order = place(&services, &[(&product, 1)]).await;
        let payment = services
            .payments
            .create_for_order(order.id(), PaymentMethod::Cash, &cancel)
            .await
            .unwrap();

        let err = services
            .payments
            .complete(payment.id(), Money::from_units(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Payment(PaymentError::InsufficientFunds { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::InsufficientResource);

        let payment = services
            .payments
            .complete(payment.id(), Money::from_units(120), &cancel)
            .await
            .unwrap();
        assert_eq!(payment.status(), PaymentStatus::Succeeded);
        assert_eq!(payment.amount_paid(), Some(Money::from_units(120)));
        assert_eq!(payment.cash_change(), Some(Money::from_units(20)));

        let err = services
            .payments
            .complete(payment.id(), Money::from_units(100), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Payment(PaymentError::AlreadyProcessed)));
    }

    #[tokio::test]
    async fn second_payment_for_order_is_rejected() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        services
            .payments
            .create_for_order(order.id(), PaymentMethod::CreditCard, &cancel)
            .await
            .unwrap();
        let err = services
            .payments
            .create_for_order(order.id(), PaymentMethod::Cash, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DomainError::Payment(PaymentError::AlreadyExistsForOrder)
        ));
        assert_eq!(err.code(), 4001);
        assert_eq!(services.store.row_count("payments").await, 1);
    }

    #[tokio::test]
    async fn payment_for_unknown_order_is_not_found() {
        let services = create_services();
        let err = services
            .payments
            .create_for_order(
                OrderId::new(404),
                PaymentMethod::Cash,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn failed_payment_cannot_be_completed() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;
        let payment = services
            .payments
            .create_for_order(order.id(), PaymentMethod::BankTransfer, &cancel)
            .await
            .unwrap();

        let payment = services.payments.fail(payment.id(), &cancel).await.unwrap();
        assert_eq!(payment.status(), PaymentStatus::Failed);

        let err = services
            .payments
            .complete(payment.id(), Money::from_cents(1000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Payment(PaymentError::AlreadyProcessed)));
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn concurrent_payments_create_exactly_one() {
        let services = create_services();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let spawn_create = |method| {
            let payments = PaymentService::new(services.store.clone());
            let order_id = order.id();
            tokio::spawn(async move {
                payments
                    .create_for_order(order_id, method, &CancellationToken::new())
                    .await
            })
        };
        let first = spawn_create(PaymentMethod::Cash);
        let second = spawn_create(PaymentMethod::CreditCard);
        let outcomes = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        let loser = outcomes.iter().find_map(|o| o.as_ref().err()).unwrap();
        assert!(
            loser.is_conflict()
                || matches!(
                    loser,
                    DomainError::Payment(PaymentError::AlreadyExistsForOrder)
                )
        );
        assert_eq!(services.store.row_count("payments").await, 1);
    }

    #[tokio::test]
    async fn stale_order_write_conflicts() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        // Load a tracked copy, then let another writer change the order
        let mut stale_uow = UnitOfWork::new(services.store.clone());
        let stale = stale_uow
            .repository::<Order>()
            .first_or_default(&specifications::order_by_id(order.id()), &cancel)
            .await
            .unwrap()
            .unwrap();
        services.orders.cancel(order.id(), &cancel).await.unwrap();

        stale_uow.repository::<Order>().update(&stale).unwrap();
        let err = stale_uow.save_changes(&cancel).await.unwrap_err();

        assert!(err.is_conflict());
        let reloaded = services.orders.get_order(order.id(), &cancel).await.unwrap();
        assert_eq!(reloaded.status(), OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn read_only_order_cannot_be_staged() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let mut uow = UnitOfWork::new(services.store.clone());
        let loaded = uow
            .repository::<Order>()
            .first_or_default(
                &specifications::order_by_id_with_items_and_products(order.id()),
                &cancel,
            )
            .await
            .unwrap()
            .unwrap();

        let err = uow.repository::<Order>().update(&loaded).unwrap_err();
        assert!(matches!(err, StoreError::Untracked { .. }));
    }
}

mod specification_queries {
    use super::*;

    #[tokio::test]
    async fn and_narrows_a_named_specification() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 1)]).await;

        let by_id = specifications::order_by_id(order.id()).as_no_tracking();
        let mine = by_id.and(|o: &Order| o.user_id() == UserId::new(7));
        let theirs = by_id.and(|o: &Order| o.user_id() == UserId::new(8));

        let mut uow = UnitOfWork::new(services.store.clone());
        let mut orders = uow.repository::<Order>();
        assert!(orders.first_or_default(&mine, &cancel).await.unwrap().is_some());
        assert!(orders.first_or_default(&theirs, &cancel).await.unwrap().is_none());
        assert!(orders.first_or_default(&by_id, &cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn root_only_load_leaves_items_unloaded() {
        let services = create_services();
        let cancel = CancellationToken::new();
        let widget = seed_product(&services, "Widget", 1000, 10).await;
        let order = place(&services, &[(&widget, 2)]).await;

        let mut uow = UnitOfWork::new(services.store.clone());
        let root = uow
            .repository::<Order>()
            .first_or_default(&specifications::order_by_id(order.id()), &cancel)
            .await
            .unwrap()
            .unwrap();

        assert!(!root.items_loaded());
        assert!(root.items().is_empty());
        assert_eq!(root.total_amount().cents(), 2000);

        // Saving the root alone keeps its lines
        uow.repository::<Order>().update(&root).unwrap();
        uow.save_changes(&cancel).await.unwrap();
        let reloaded = services.orders.get_order(order.id(), &cancel).await.unwrap();
        assert_eq!(reloaded.items().len(), 1);
    }
}
