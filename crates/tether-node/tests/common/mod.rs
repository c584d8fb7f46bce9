//! Shared fixtures for the node integration tests.

#![allow(dead_code)]

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tether_node::{
    Capabilities, Method, MethodCall, Node, NodeConfig, SharedObject, SharedType, TetherResult,
    Value,
};
use tracing_subscriber::EnvFilter;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Log to the test writer, filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct World {
    pub population: i64,
    pub name: String,
}

/// Add to the population through routed access, returning the new value.
fn grow(
    world: Arc<SharedObject<World>>,
    call: MethodCall,
) -> BoxFuture<'static, TetherResult<Value>> {
    async move {
        let by: i64 = call.arg(0)?;
        let current: i64 = world.get_as("population").await?;
        world.set("population", json!(current + by)).await?;
        Ok(json!(current + by))
    }
    .boxed()
}

fn reset(
    world: Arc<SharedObject<World>>,
    _call: MethodCall,
) -> BoxFuture<'static, TetherResult<Value>> {
    async move {
        world.write().population = 0;
        Ok(Value::Null)
    }
    .boxed()
}

impl SharedType for World {
    const TYPE_TAG: &'static str = "demo.World";

    fn capabilities() -> &'static Capabilities<Self> {
        static CAPS: OnceLock<Capabilities<World>> = OnceLock::new();
        CAPS.get_or_init(|| {
            Capabilities::new()
                .property(
                    "population",
                    |w: &World| json!(w.population),
                    |w: &mut World, v: Value| {
                        w.population = serde_json::from_value(v)?;
                        Ok(())
                    },
                )
                .read_only("name", |w: &World| json!(w.name))
                .method("grow", Method::new(grow).client_callable())
                .method("reset", Method::new(reset))
        })
    }
}

pub fn world(name: &str, population: i64) -> Arc<SharedObject<World>> {
    SharedObject::new(
        name,
        World {
            population,
            name: name.to_string(),
        },
    )
}

/// A bound node that knows the `World` type.
pub async fn node(config: NodeConfig) -> Node {
    init_tracing();
    let node = Node::new(config);
    node.register_type::<World>();
    node.bind(LOCALHOST, 0).await.unwrap();
    node
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
