//! HTTP surface: peer messages, read endpoints and cluster administration.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use consensus::{MembershipChange, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::{ReadConsistency, Registry};
use crate::error::{RegistryError, RegistryResult};

/// Build the router for a registry node
///
/// Returns a Router that can be served with any tower-compatible server
pub fn router(registry: Registry) -> Router {
    let mailbox = registry.mailbox();
    Router::new()
        .route("/v2/", get(api_version_check))
        .route("/v2/_catalog", get(catalog))
        .route("/v2/{*path}", get(list_tags))
        .route("/admin/status", get(status))
        .route("/admin/members", post(add_member))
        .route("/admin/members/{id}", delete(remove_member))
        .with_state(registry)
        .merge(consensus::http::router(mailbox))
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    #[serde(default)]
    consistency: ReadConsistency,
}

/// Tag list response
#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

/// List tags for a repository. Repository names contain slashes, so the
/// whole path after `/v2/` is matched and split here.
async fn list_tags(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    Query(params): Query<ReadParams>,
) -> RegistryResult<Json<TagList>> {
    let name = path
        .strip_suffix("/tags/list")
        .ok_or_else(|| RegistryError::InvalidRepository(path.clone()))?;
    let tags = registry.list_tags(name, params.consistency).await?;
    Ok(Json(TagList {
        name: name.to_owned(),
        tags,
    }))
}

async fn catalog(
    State(registry): State<Registry>,
    Query(params): Query<ReadParams>,
) -> RegistryResult<Json<Catalog>> {
    let repositories = registry.repositories(params.consistency).await?;
    Ok(Json(Catalog { repositories }))
}

async fn status(State(registry): State<Registry>) -> Json<NodeStatus> {
    Json(registry.status())
}

#[derive(Debug, Deserialize)]
struct AddMember {
    id: NodeId,
    address: String,
    #[serde(default = "default_voter")]
    voter: bool,
}

fn default_voter() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct MembershipCommitted {
    index: u64,
}

async fn add_member(
    State(registry): State<Registry>,
    Json(member): Json<AddMember>,
) -> RegistryResult<Json<MembershipCommitted>> {
    let change = if member.voter {
        MembershipChange::AddVoter {
            id: member.id,
            address: member.address,
        }
    } else {
        MembershipChange::AddLearner {
            id: member.id,
            address: member.address,
        }
    };
    let index = registry.propose_membership_change(change).await?;
    Ok(Json(MembershipCommitted { index }))
}

async fn remove_member(
    State(registry): State<Registry>,
    Path(id): Path<NodeId>,
) -> RegistryResult<Json<MembershipCommitted>> {
    let index = registry
        .propose_membership_change(MembershipChange::Remove { id })
        .await?;
    Ok(Json(MembershipCommitted { index }))
}
