#![allow(dead_code)]

use std::sync::{Arc, Weak};

use entity_access::{
    Entity, EntityEnum, MemoryProvider, SecureDb, SecurityRules, SecurityRulesBuilder,
};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct Principal {
    pub region: String,
}

impl Principal {
    pub fn region(region: &str) -> Self {
        Self {
            region: region.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EntityEnum)]
pub enum OrderStatus {
    Open,
    Closed,
    #[entity(rename = "on-hold")]
    OnHold,
}

#[derive(Entity)]
pub struct Customer {
    #[entity(key)]
    pub id: i64,
    pub name: String,
    pub region: String,
    pub orders: RwLock<Vec<Arc<Order>>>,
}

#[derive(Entity)]
pub struct Order {
    #[entity(key)]
    pub id: i64,
    pub total: i64,
    pub status: OrderStatus,
    pub customer: Weak<Customer>,
    pub lines: Vec<Arc<OrderLine>>,
    #[entity(ignore)]
    pub reviewer: Option<Arc<Customer>>,
}

#[derive(Entity)]
pub struct OrderLine {
    #[entity(key)]
    pub id: i64,
    #[entity(rename = "SKU")]
    pub sku: String,
    pub qty: i64,
    #[entity(skip_null)]
    pub note: Option<String>,
}

pub fn customer(id: i64, name: &str, region: &str) -> Arc<Customer> {
    Arc::new(Customer {
        id,
        name: name.to_owned(),
        region: region.to_owned(),
        orders: RwLock::new(Vec::new()),
    })
}

pub fn line(id: i64, sku: &str, qty: i64) -> Arc<OrderLine> {
    Arc::new(OrderLine {
        id,
        sku: sku.to_owned(),
        qty,
        note: None,
    })
}

pub fn order(
    id: i64,
    total: i64,
    status: OrderStatus,
    owner: &Arc<Customer>,
    lines: Vec<Arc<OrderLine>>,
) -> Arc<Order> {
    let order = Arc::new(Order {
        id,
        total,
        status,
        customer: Arc::downgrade(owner),
        lines,
        reviewer: Some(Arc::clone(owner)),
    });
    owner.orders.write().push(Arc::clone(&order));
    order
}

/// Two customers (US and EU) with three orders:
///
/// | order | customer | total | status | lines (qty) |
/// |-------|----------|-------|--------|-------------|
/// | 1 | Ada (US) | 250 | Open | 11 (2), 12 (0) |
/// | 2 | Ada (US) | 40 | Closed | 13 (1) |
/// | 3 | Bjorn (EU) | 900 | Open | none |
pub struct Shop {
    pub provider: Arc<MemoryProvider>,
    pub ada: Arc<Customer>,
    pub bjorn: Arc<Customer>,
    pub orders: Vec<Arc<Order>>,
}

pub fn shop() -> Shop {
    let provider = Arc::new(MemoryProvider::new());
    let ada = customer(1, "Ada", "US");
    let bjorn = customer(2, "Bjorn", "EU");

    let l11 = line(11, "apple", 2);
    let l12 = line(12, "pear", 0);
    let l13 = line(13, "plum", 1);
    let orders = vec![
        order(1, 250, OrderStatus::Open, &ada, vec![Arc::clone(&l11), Arc::clone(&l12)]),
        order(2, 40, OrderStatus::Closed, &ada, vec![Arc::clone(&l13)]),
        order(3, 900, OrderStatus::Open, &bjorn, Vec::new()),
    ];

    provider.seed([Arc::clone(&ada), Arc::clone(&bjorn)]);
    provider.seed(orders.iter().cloned());
    provider.seed([l11, l12, l13]);

    Shop {
        provider,
        ada,
        bjorn,
        orders,
    }
}

/// Customers are visible only inside the principal's region.
pub fn regional_rules() -> SecurityRulesBuilder<Principal> {
    SecurityRules::<Principal>::builder().select::<Customer, _>(|q, p| {
        let region = p.region.clone();
        Ok(q.filter(move |c| c.member("region").equals(region)))
    })
}

pub fn db(shop: &Shop, rules: SecurityRulesBuilder<Principal>, region: &str) -> SecureDb<Principal> {
    SecureDb::new(
        Arc::clone(&shop.provider) as Arc<dyn entity_access::QueryProvider>,
        Arc::new(rules.build()),
        Principal::region(region),
    )
}
