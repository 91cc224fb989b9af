//! In-process backend serving the counter and posts endpoints.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::{
    ApiDefinition, EndpointDefinition, EntityTag, TagDescription, TagSpec, Transport,
    TransportContext, TransportError,
};

pub const COUNTER: &str = "Counter";
pub const POST: &str = "Post";

pub const GET_COUNT: &str = "getCount";
pub const INCREMENT_COUNT: &str = "incrementCount";
pub const DECREMENT_COUNT: &str = "decrementCount";
pub const GET_POSTS: &str = "getPosts";
pub const GET_POST: &str = "getPost";
pub const UPDATE_POST: &str = "updatePost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub name: String,
}

/// Requests the backend understands, derived from endpoint arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    GetCount,
    AdjustCount(i64),
    ListPosts,
    GetPost(Option<i64>),
    UpdatePost(Value),
}

#[derive(Debug)]
struct ServerState {
    count: i64,
    posts: BTreeMap<i64, Post>,
}

/// Backend holding a counter and a handful of posts behind a simulated latency.
#[derive(Debug)]
pub struct DemoServer {
    latency: Duration,
    state: Mutex<ServerState>,
}

impl DemoServer {
    pub fn new(latency: Duration) -> Self {
        let posts = [(1, "A sample post"), (2, "A post about tags")]
            .into_iter()
            .map(|(id, name)| {
                (
                    id,
                    Post {
                        id,
                        name: name.to_string(),
                    },
                )
            })
            .collect();

        Self {
            latency,
            state: Mutex::new(ServerState { count: 0, posts }),
        }
    }

    pub async fn count(&self) -> i64 {
        self.state.lock().await.count
    }

    async fn handle(
        &self,
        request: ServerRequest,
        ctx: &TransportContext,
    ) -> Result<Value, TransportError> {
        let mut state = self.state.lock().await;
        match request {
            ServerRequest::GetCount => Ok(json!({ "count": state.count })),
            ServerRequest::AdjustCount(amount) => {
                state.count += amount;
                Ok(json!({ "count": state.count }))
            }
            ServerRequest::ListPosts => {
                let posts: Vec<&Post> = state.posts.values().collect();
                serde_json::to_value(posts).map_err(|err| TransportError::unexpected(err.to_string()))
            }
            ServerRequest::GetPost(id) => match id.and_then(|id| state.posts.get(&id)) {
                Some(post) => serde_json::to_value(post)
                    .map_err(|err| TransportError::unexpected(err.to_string())),
                None => Err(ctx.reject_with_value(json!({ "status": 404, "id": id }))),
            },
            ServerRequest::UpdatePost(patch) => {
                let post: Post = serde_json::from_value(patch).map_err(|err| {
                    ctx.reject_with_value(json!({ "status": 400, "error": err.to_string() }))
                })?;
                match state.posts.get_mut(&post.id) {
                    Some(existing) => {
                        existing.name = post.name;
                        serde_json::to_value(&*existing)
                            .map_err(|err| TransportError::unexpected(err.to_string()))
                    }
                    None => Err(ctx.reject_with_value(json!({ "status": 404, "id": post.id }))),
                }
            }
        }
    }
}

#[async_trait]
impl Transport for DemoServer {
    type Args = ServerRequest;

    async fn execute(
        &self,
        args: ServerRequest,
        ctx: TransportContext,
    ) -> Result<Value, TransportError> {
        debug!(endpoint = ctx.endpoint(), request = ?args, "Serving request");

        tokio::select! {
            _ = ctx.signal().cancelled() => {
                return Err(TransportError::unexpected("request aborted"));
            }
            _ = tokio::time::sleep(self.latency) => {}
        }

        self.handle(args, &ctx).await
    }
}

/// Endpoint declarations for [`DemoServer`].
pub fn definition() -> ApiDefinition<ServerRequest> {
    ApiDefinition::new([COUNTER, POST])
        .endpoint(
            EndpointDefinition::query(GET_COUNT, |_: &Value| ServerRequest::GetCount)
                .provides(TagSpec::fixed([COUNTER])),
        )
        .endpoint(
            EndpointDefinition::mutation(INCREMENT_COUNT, |arg: &Value| {
                ServerRequest::AdjustCount(arg.as_i64().unwrap_or(1))
            })
            .invalidates(TagSpec::fixed([COUNTER])),
        )
        .endpoint(
            EndpointDefinition::mutation(DECREMENT_COUNT, |arg: &Value| {
                ServerRequest::AdjustCount(-arg.as_i64().unwrap_or(1))
            })
            .invalidates(TagSpec::fixed([COUNTER])),
        )
        .endpoint(
            EndpointDefinition::query(GET_POSTS, |_: &Value| ServerRequest::ListPosts).provides(
                TagSpec::computed(|result: &Value, _: &Value| {
                    let mut tags: Vec<TagDescription> = result
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|post| post.get("id").and_then(Value::as_i64))
                        .map(|id| EntityTag::with_id(POST, id).into())
                        .collect();
                    tags.push(POST.into());
                    tags
                }),
            ),
        )
        .endpoint(
            EndpointDefinition::query(GET_POST, |arg: &Value| {
                ServerRequest::GetPost(arg.as_i64())
            })
            .provides(TagSpec::computed(|_: &Value, arg: &Value| {
                arg.as_i64()
                    .map(|id| vec![EntityTag::with_id(POST, id).into()])
                    .unwrap_or_default()
            })),
        )
        .endpoint(
            EndpointDefinition::mutation(UPDATE_POST, |arg: &Value| {
                ServerRequest::UpdatePost(arg.clone())
            })
            .invalidates(TagSpec::computed(|_: &Value, arg: &Value| {
                arg.get("id")
                    .and_then(Value::as_i64)
                    .map(|id| vec![EntityTag::with_id(POST, id).into()])
                    .unwrap_or_default()
            })),
        )
}
