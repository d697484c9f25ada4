//! The wallet's HTTP surface (base spec §6): three REST routes layered over
//! the same [`smellycoin_network::GossipContext`] the gossip state machine
//! uses, so a submitted transaction goes through exactly the validation and
//! broadcast path an inbound `DATA` frame would.

use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::CorsLayer;

use smellycoin_core::{PubKeyHash, Transaction};
use smellycoin_network::GossipContext;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("invalid public key hash format")]
    InvalidPubKeyHash,
    #[error("transaction rejected: {0}")]
    Rejected(#[from] smellycoin_network::GossipError),
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match self {
            RpcError::InvalidPubKeyHash | RpcError::Rejected(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Decode a `pubKeyHash` query value (hex, base spec §6 / `wallet_routes.go`)
/// into the raw 20-byte RIPEMD160(SHA256(pubkey)) payload.
fn decode_pub_key_hash(hex_str: &str) -> Result<PubKeyHash, RpcError> {
    let bytes = hex::decode(hex_str).map_err(|_| RpcError::InvalidPubKeyHash)?;
    bytes.try_into().map_err(|_| RpcError::InvalidPubKeyHash)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Build the wallet router. `ctx` is cloned into every handler; cloning is
/// cheap since every field behind it is already an `Arc`.
pub fn router(ctx: GossipContext) -> Router {
    Router::new()
        .route("/wallet/transactions", post(submit_transaction))
        .route("/wallet/utxos", get(utxos))
        .route("/wallet/spendable_utxos", get(spendable_utxos))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn serve(bind_addr: SocketAddr, ctx: GossipContext) -> std::io::Result<()> {
    info!("wallet HTTP surface listening on {bind_addr}");
    axum::Server::bind(&bind_addr).serve(router(ctx).into_make_service()).await.map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::Other, err)
    })
}

#[derive(Serialize)]
struct SubmitTransactionResponse {
    hash: String,
}

async fn submit_transaction(
    State(ctx): State<GossipContext>,
    Json(tx): Json<Transaction>,
) -> Result<Json<SubmitTransactionResponse>, RpcError> {
    let hash = ctx.add_tx_to_mempool(tx).await?;
    Ok(Json(SubmitTransactionResponse { hash: hex::encode(hash) }))
}

#[derive(Deserialize)]
struct PubKeyHashQuery {
    #[serde(rename = "pubKeyHash")]
    pub_key_hash: String,
}

#[derive(Serialize)]
struct Utxo {
    tx_hash: String,
    output_index: u32,
    value: u64,
}

#[derive(Serialize)]
struct UtxosResponse {
    utxos: Vec<Utxo>,
}

async fn utxos(
    State(ctx): State<GossipContext>,
    Query(query): Query<PubKeyHashQuery>,
) -> Result<Json<UtxosResponse>, RpcError> {
    let pub_key_hash = decode_pub_key_hash(&query.pub_key_hash)?;
    let utxos = ctx
        .find_utxos(&pub_key_hash)
        .into_iter()
        .map(|(tx_hash, output_index, output)| Utxo {
            tx_hash: hex::encode(tx_hash),
            output_index,
            value: output.value,
        })
        .collect();
    Ok(Json(UtxosResponse { utxos }))
}

#[derive(Deserialize)]
struct SpendableUtxosQuery {
    #[serde(rename = "pubKeyHash")]
    pub_key_hash: String,
    amount: u64,
}

#[derive(Serialize)]
struct SpendableUtxosResponse {
    total: u64,
    utxos: Vec<SpendableUtxo>,
}

#[derive(Serialize)]
struct SpendableUtxo {
    tx_hash: String,
    output_index: u32,
}

async fn spendable_utxos(
    State(ctx): State<GossipContext>,
    Query(query): Query<SpendableUtxosQuery>,
) -> Result<Json<SpendableUtxosResponse>, RpcError> {
    let pub_key_hash = decode_pub_key_hash(&query.pub_key_hash)?;
    let (total, selected) = ctx.find_spendable_utxos(&pub_key_hash, query.amount);
    let utxos = selected
        .into_iter()
        .map(|(tx_hash, output_index)| SpendableUtxo { tx_hash: hex::encode(tx_hash), output_index })
        .collect();
    Ok(Json(SpendableUtxosResponse { total, utxos }))
}
