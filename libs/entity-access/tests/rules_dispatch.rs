#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Rule resolution for selects and mutations, and the lifecycle hooks that
//! surround saves.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{Customer, Order, Principal, customer, db, regional_rules, shop};
use entity_access::{
    AccessError, EntityEvents, EntityType, Filters, ObjectRef, Operation, SecureDb, SecurityRules,
    Value, unauthorized,
};
use tokio_util::sync::CancellationToken;

fn regional_insert() -> entity_access::SecurityRulesBuilder<Principal> {
    regional_rules().insert::<Customer, _>(|q, p| {
        let region = p.region.clone();
        Ok(q.filter(move |c| c.member("region").equals(region)))
    })
}

#[tokio::test]
async fn test_insert_without_rule_is_denied() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");

    let err = db
        .insert(customer(10, "Cleo", "US"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AccessError::UnauthorizedAccess {
            entity: "Customer",
            operation: Operation::Insert
        }
    ));
    assert!(err.is_denial());
    assert_eq!(shop.provider.len_of::<Customer>(), 2);
}

#[tokio::test]
async fn test_insert_rule_filters_by_principal() {
    let shop = shop();
    let db = db(&shop, regional_insert(), "US");
    let cancel = CancellationToken::new();

    db.insert(customer(10, "Cleo", "US"), &cancel).await.unwrap();
    let err = db
        .insert(customer(11, "Dag", "EU"), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_denial());
    assert_eq!(shop.provider.len_of::<Customer>(), 3);
    let names: Vec<Value> = db
        .query::<Customer>()
        .unwrap()
        .to_list(&cancel)
        .await
        .unwrap()
        .iter()
        .map(|c| c.field("name").unwrap_or_default())
        .collect();
    assert_eq!(names, vec![Value::from("Ada"), Value::from("Cleo")]);
}

#[tokio::test]
async fn test_unauthorized_filter_always_denies() {
    let shop = shop();
    let rules = regional_rules().delete::<Customer, _>(unauthorized);
    let db = db(&shop, rules, "US");

    let err = db
        .delete(Arc::clone(&shop.ada), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AccessError::UnauthorizedAccess {
            operation: Operation::Delete,
            ..
        }
    ));
    assert_eq!(shop.provider.len_of::<Customer>(), 2);
}

#[tokio::test]
async fn test_modify_covers_update_and_delete() {
    let shop = shop();
    let rules = regional_rules().modify::<Customer, _>(|q, p| {
        let region = p.region.clone();
        Ok(q.filter(move |c| c.member("region").equals(region)))
    });
    let db = db(&shop, rules, "US");
    let cancel = CancellationToken::new();

    let renamed = customer(1, "Ada Lovelace", "US");
    db.update(Arc::clone(&renamed), &cancel).await.unwrap();
    let stored = shop.provider.rows_of(EntityType::of::<Customer>());
    assert!(stored[0].ptr_eq(&ObjectRef::from_entity(renamed)));

    assert!(db.update(Arc::clone(&shop.bjorn), &cancel).await.unwrap_err().is_denial());
    assert!(db.delete(Arc::clone(&shop.bjorn), &cancel).await.unwrap_err().is_denial());

    db.delete(customer(1, "Ada", "US"), &cancel).await.unwrap();
    assert_eq!(shop.provider.len_of::<Customer>(), 1);
}

#[tokio::test]
async fn test_specific_rule_overrides_modify() {
    let shop = shop();
    let rules = regional_rules()
        .modify::<Customer, _>(entity_access::allow)
        .deny::<Customer>(Operation::Delete);
    let db = db(&shop, rules, "US");
    let cancel = CancellationToken::new();

    db.update(Arc::clone(&shop.bjorn), &cancel).await.unwrap();
    let err = db.delete(Arc::clone(&shop.bjorn), &cancel).await.unwrap_err();
    assert!(err.is_denial());
}

#[tokio::test]
async fn test_last_registration_wins() {
    let shop = shop();
    let rules = regional_rules()
        .deny::<Order>(Operation::Select)
        .allow::<Order>(Operation::Select);
    let db = db(&shop, rules, "US");

    let count = db
        .query::<Order>()
        .unwrap()
        .count(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_set_filters_registers_each_operation() {
    let shop = shop();
    let filters = Filters::<Order, Principal>::new()
        .select(|q, _| Ok(q.filter(|o| o.member("total").greater_than(100))))
        .insert(|q, _| Ok(q.filter(|o| o.member("total").less_than(1_000))));
    let rules = regional_rules().set_filters(filters).build();
    let order = EntityType::of::<Order>();

    assert!(rules.has_rule(order, Operation::Select));
    assert!(rules.has_rule(order, Operation::Insert));
    assert!(!rules.has_rule(order, Operation::Update));

    let db = SecureDb::new(
        Arc::clone(&shop.provider) as Arc<dyn entity_access::QueryProvider>,
        Arc::new(rules),
        Principal::region("US"),
    );
    let cancel = CancellationToken::new();
    assert_eq!(db.query::<Order>().unwrap().count(&cancel).await.unwrap(), 2);
    let err = db
        .update(Arc::clone(&shop.orders[0]), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_denial(), "no update filter was given");
}

#[tokio::test]
async fn test_set_all_filters_and_authorize() {
    let shop = shop();
    let rules = SecurityRules::<Principal>::builder().set_all_filters::<Customer, _>(|q, p| {
        let region = p.region.clone();
        Ok(q.filter(move |c| c.member("region").equals(region)))
    });
    let db = db(&shop, rules, "EU");
    let cancel = CancellationToken::new();

    for operation in [Operation::Select, Operation::Insert, Operation::Update, Operation::Delete] {
        db.authorize(operation, &shop.bjorn, &cancel).await.unwrap();
        let err = db.authorize(operation, &shop.ada, &cancel).await.unwrap_err();
        assert!(err.is_denial());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolution_compiles_once() {
    let shop = shop();
    let rules = Arc::new(regional_rules().build());
    let db = SecureDb::new(
        Arc::clone(&shop.provider) as Arc<dyn entity_access::QueryProvider>,
        Arc::clone(&rules),
        Principal::region("US"),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.query::<Customer>().map(|_| ()) })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(rules.resolved_count(), 1);
    db.query::<Order>().unwrap();
    assert_eq!(rules.resolved_count(), 2);
}

#[derive(Default)]
struct CountingEvents {
    before: AtomicUsize,
    after: AtomicUsize,
    veto_deletes: bool,
}

#[async_trait]
impl EntityEvents for CountingEvents {
    async fn inserting(&self, _entity: &ObjectRef) -> Result<(), AccessError> {
        self.before.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn inserted(&self, _entity: &ObjectRef) -> Result<(), AccessError> {
        self.after.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deleting(&self, entity: &ObjectRef) -> Result<(), AccessError> {
        self.before.fetch_add(1, Ordering::SeqCst);
        if self.veto_deletes {
            return Err(AccessError::Evaluation(format!(
                "{} rows are archived, not deleted",
                entity.type_name()
            )));
        }
        Ok(())
    }

    async fn deleted(&self, _entity: &ObjectRef) -> Result<(), AccessError> {
        self.after.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_hooks_run_around_save() {
    let shop = shop();
    let events = Arc::new(CountingEvents::default());
    shop.provider
        .register_events::<Customer>(Arc::clone(&events) as Arc<dyn EntityEvents>);
    let db = db(&shop, regional_insert(), "US");

    db.insert(customer(10, "Cleo", "US"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(events.before.load(Ordering::SeqCst), 1);
    assert_eq!(events.after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_denied_mutation_skips_hooks() {
    let shop = shop();
    let events = Arc::new(CountingEvents::default());
    shop.provider
        .register_events::<Customer>(Arc::clone(&events) as Arc<dyn EntityEvents>);
    let db = db(&shop, regional_insert(), "US");

    let err = db
        .insert(customer(11, "Dag", "EU"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_denial());
    assert_eq!(events.before.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pre_hook_error_aborts_save() {
    let shop = shop();
    let events = Arc::new(CountingEvents {
        veto_deletes: true,
        ..CountingEvents::default()
    });
    shop.provider
        .register_events::<Customer>(Arc::clone(&events) as Arc<dyn EntityEvents>);
    let rules = regional_rules().delete::<Customer, _>(entity_access::allow);
    let db = db(&shop, rules, "US");

    let err = db
        .delete(Arc::clone(&shop.ada), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(!err.is_denial());
    assert!(err.to_string().contains("archived"));
    assert_eq!(events.after.load(Ordering::SeqCst), 0);
    assert_eq!(shop.provider.len_of::<Customer>(), 2);
}
