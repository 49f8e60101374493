//! kinetik-api — REST API for Kinetik.
//!
//! Thin axum layer over the [`Orchestrator`]. Every response uses the
//! `{success, data?, error?}` envelope; failed deployments also carry
//! their partial report in `data`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/services` | List services |
//! | POST | `/api/v1/services` | Deploy a stack |
//! | GET | `/api/v1/services/{stack}/{service}` | Get a service |
//! | DELETE | `/api/v1/services/{stack}/{service}` | Delete a service |
//! | POST | `/api/v1/services/{stack}/{service}/scale/up` | Add a replica |
//! | POST | `/api/v1/services/{stack}/{service}/scale/down` | Remove a replica |
//! | POST | `/api/v1/services/{stack}/{service}/reconcile` | Converge replicas |
//! | GET | `/api/v1/nodes` | List nodes |
//! | GET | `/api/v1/nodes/{id}` | Get a node |
//! | POST | `/api/v1/nodes/{id}` | Node self-report |
//! | DELETE | `/api/v1/nodes/{id}` | Forget a node |
//! | POST | `/api/v1/nodes/{id}/attach` | Wait for the node runtime |
//! | GET | `/api/v1/instances` | List instances |
//! | PUT | `/api/v1/instances/{id}` | Push instance health |
//! | DELETE | `/api/v1/instances/{id}` | Remove an instance |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use kinetik_scheduler::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/services", get(handlers::list_services).post(handlers::deploy))
        .route(
            "/services/{stack}/{service}",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route("/services/{stack}/{service}/scale/up", post(handlers::scale_up))
        .route("/services/{stack}/{service}/scale/down", post(handlers::scale_down))
        .route("/services/{stack}/{service}/reconcile", post(handlers::reconcile))
        .route("/nodes", get(handlers::list_nodes))
        .route(
            "/nodes/{id}",
            get(handlers::get_node)
                .post(handlers::report_node)
                .delete(handlers::delete_node),
        )
        .route("/nodes/{id}/attach", post(handlers::attach_node))
        .route("/instances", get(handlers::list_instances))
        .route(
            "/instances/{id}",
            axum::routing::put(handlers::update_instance).delete(handlers::remove_instance),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
