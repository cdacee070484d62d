use kasane::catalog::EventCatalog;
use kasane::serde::Json;
use kasane::slicing::MultiStreamSlicer;
use kasane::stream::StreamIdentity;
use kasane::{AggregateDispatcher, AggregateProjection, StreamAction, Version};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ACCOUNTS: &str = "Accounts";
pub const ACCOUNTS_SHARD: &str = "Accounts:All";
pub const CUSTOMER_STATS: &str = "CustomerStats";
pub const CUSTOMER_STATS_SHARD: &str = "CustomerStats:All";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub owner: String,
    pub balance: u64,
    pub version: Version,
}

#[derive(Debug, Clone)]
pub struct AccountOpened {
    pub owner: String,
}

#[derive(Debug, Clone)]
pub struct Deposited {
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct Withdrawn {
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct AccountClosed;

pub fn accounts() -> AggregateProjection<Account, String> {
    let mut dispatcher = AggregateDispatcher::<Account>::new(ACCOUNTS, Arc::new(EventCatalog::new()));
    dispatcher
        .aggregate_methods()
        .create(|e: &AccountOpened| Account {
            owner: e.owner.clone(),
            ..Account::default()
        })
        .apply(|account: &mut Account, e: &Deposited| account.balance += e.amount)
        .try_apply(|mut account: Account, e: &Withdrawn| -> Result<Option<Account>, String> {
            if e.amount > account.balance {
                return Err(format!("cannot withdraw {} from {}", e.amount, account.balance));
            }
            account.balance -= e.amount;
            Ok(Some(account))
        })
        .should_delete(|_: &Account, _: &AccountClosed| true);

    let mut projection = AggregateProjection::single_stream(dispatcher, Json::<Account>::default());
    projection
        .runner_mut()
        .identity_setter(|account: &mut Account, id: &String| account.id = id.clone())
        .version_setter(|account: &mut Account, version| account.version = version);
    projection
}

pub fn open(id: &str, owner: &str) -> StreamAction {
    StreamAction::start(StreamIdentity::Key(id.to_string())).with(AccountOpened {
        owner: owner.to_string(),
    })
}

pub fn deposit(id: &str, amount: u64) -> StreamAction {
    StreamAction::append(StreamIdentity::Key(id.to_string())).with(Deposited { amount })
}

pub fn withdraw(id: &str, amount: u64) -> StreamAction {
    StreamAction::append(StreamIdentity::Key(id.to_string())).with(Withdrawn { amount })
}

pub fn close(id: &str) -> StreamAction {
    StreamAction::append(StreamIdentity::Key(id.to_string())).with(AccountClosed)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerStats {
    pub id: String,
    pub orders: u32,
    pub spent: u64,
}

#[derive(Debug, Clone)]
pub struct OrderPlaced {
    pub customer: String,
    pub total: u64,
}

pub fn customer_stats() -> AggregateProjection<CustomerStats, String> {
    let catalog = Arc::new(EventCatalog::new());
    let mut dispatcher = AggregateDispatcher::<CustomerStats>::new(CUSTOMER_STATS, catalog.clone());
    dispatcher
        .aggregate_methods()
        .create(|e: &OrderPlaced| CustomerStats {
            orders: 1,
            spent: e.total,
            ..CustomerStats::default()
        })
        .apply(|stats: &mut CustomerStats, e: &OrderPlaced| {
            stats.orders += 1;
            stats.spent += e.total;
        });

    let mut slicer = MultiStreamSlicer::<CustomerStats, String>::new(catalog);
    slicer.identity(|e: &OrderPlaced| e.customer.clone());

    let mut projection = AggregateProjection::multi_stream(dispatcher, Json::<CustomerStats>::default(), slicer);
    projection
        .runner_mut()
        .identity_setter(|stats: &mut CustomerStats, id: &String| stats.id = id.clone());
    projection
}

pub fn place_order(order: &str, customer: &str, total: u64) -> StreamAction {
    StreamAction::start(StreamIdentity::Key(order.to_string())).with(OrderPlaced {
        customer: customer.to_string(),
        total,
    })
}
