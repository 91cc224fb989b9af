//! Scripted transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tagcache::cache::{Transport, TransportContext, TransportError};

/// Transport arguments: simulated latency plus the caller's argument.
#[derive(Debug, Clone)]
pub struct Call {
    pub latency: Duration,
    pub arg: Value,
}

/// Endpoint argument mapping that delays every call by `millis`.
pub fn after(millis: u64) -> impl Fn(&Value) -> Call + Send + Sync + 'static {
    move |arg: &Value| Call {
        latency: Duration::from_millis(millis),
        arg: arg.clone(),
    }
}

/// Counts calls per endpoint and answers with `{"endpoint", "arg", "call"}`.
///
/// While [`set_failing`](Self::set_failing) is on, every call rejects with a
/// `{"status": 500}` payload.
/// `incrementCount` adds its argument to a shared counter that `getCount` reads.
#[derive(Debug, Default)]
pub struct Scripted {
    calls: Mutex<HashMap<String, usize>>,
    count: Mutex<i64>,
    failing: AtomicBool,
}

impl Scripted {
    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for Scripted {
    type Args = Call;

    async fn execute(&self, args: Call, ctx: TransportContext) -> Result<Value, TransportError> {
        let call = {
            let mut calls = self.calls.lock().expect("calls lock");
            let entry = calls.entry(ctx.endpoint().to_string()).or_default();
            *entry += 1;
            *entry
        };

        tokio::time::sleep(args.latency).await;

        if self.failing.load(Ordering::SeqCst) {
            return Err(ctx.reject_with_value(json!({ "status": 500 })));
        }

        match ctx.endpoint() {
            "getCount" => Ok(json!({ "count": *self.count.lock().expect("count lock") })),
            "incrementCount" => {
                let mut count = self.count.lock().expect("count lock");
                *count += args.arg.as_i64().unwrap_or(1);
                Ok(json!({ "count": *count }))
            }
            endpoint => Ok(json!({ "endpoint": endpoint, "arg": args.arg, "call": call })),
        }
    }
}
