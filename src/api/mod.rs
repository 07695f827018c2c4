//! HTTP/WebSocket server: the JSON-RPC POST endpoint and the framed duplex
//! channel upgrade.

use bytes::Bytes;
use color_eyre::{eyre::WrapErr, Result};
use futures::{FutureExt, StreamExt};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::message::Frame;
use crate::service::RpcService;
use crate::session::Session;
use crate::utils::spawn_in_span;

fn with_service(
	service: Arc<RpcService>,
) -> impl Filter<Extract = (Arc<RpcService>,), Error = Infallible> + Clone {
	warp::any().map(move || service.clone())
}

pub fn health_route() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::head()
		.or(warp::get())
		.and(warp::path("health"))
		.map(|_| warp::reply::with_status("", warp::http::StatusCode::OK))
}

pub fn jsonrpc_route(
	service: Arc<RpcService>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path("jsonrpc")
		.and(warp::post())
		.and(warp::body::bytes())
		.and(with_service(service))
		.then(|body: Bytes, service: Arc<RpcService>| async move {
			let body = String::from_utf8_lossy(&body).into_owned();
			let response = service.jsonrpc().dispatch(&body).await;
			warp::reply::with_header(response, "content-type", "application/json")
		})
}

pub fn ws_route(
	service: Arc<RpcService>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path("ws")
		.and(warp::ws())
		.and(warp::addr::remote())
		.and(with_service(service))
		.map(
			|ws: warp::ws::Ws, remote: Option<SocketAddr>, service: Arc<RpcService>| {
				ws.on_upgrade(move |web_socket| {
					let endpoint = remote
						.map(|address| address.to_string())
						.unwrap_or_else(|| format!("client-{}", Uuid::new_v4().as_simple()));
					connect(web_socket, endpoint, service)
				})
			},
		)
}

pub fn routes(
	service: Arc<RpcService>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	health_route()
		.or(jsonrpc_route(service.clone()))
		.or(ws_route(service))
}

/// Binds the server; resolves once the shutdown controller triggers and the
/// listener drains.
pub async fn serve(service: Arc<RpcService>) -> Result<()> {
	let rpc = service.config().rpc.clone();
	let addr = SocketAddr::from_str(&format!("{}:{}", rpc.listen_ip, rpc.listen_port))
		.wrap_err("Unable to parse listen address from config")?;

	let shutdown_signal = service.shutdown().triggered_shutdown().map(|_| ());
	let (bound, server) =
		warp::serve(routes(service.clone())).bind_with_graceful_shutdown(addr, shutdown_signal);
	info!("RPC gateway running on {bound}");
	server.await;
	Ok(())
}

/// Runs one client connection: registers the session, forwards queued
/// outbound frames to the socket, and feeds inbound frames through the
/// pending-response table into the router. The reader never blocks on
/// dispatch. Any read error, close, or malformed frame tears the session
/// down through the single disconnect path.
pub async fn connect(web_socket: WebSocket, endpoint: String, service: Arc<RpcService>) {
	let (ws_sender, mut ws_receiver) = web_socket.split();
	let (session, outbound) = Session::new(endpoint.clone());

	let outbound_stream =
		UnboundedReceiverStream::new(outbound).map(|bytes| Ok(Message::binary(bytes.to_vec())));
	spawn_in_span(outbound_stream.forward(ws_sender).map(|result| {
		if let Err(error) = result {
			debug!(%error, "Error sending web socket message");
		}
	}));

	service.registry().add(session.clone());

	while let Some(result) = ws_receiver.next().await {
		let message = match result {
			Err(error) => {
				error!(endpoint, %error, "Error receiving client message");
				break;
			},
			Ok(message) => message,
		};
		if message.is_close() {
			debug!(endpoint, "Client closed the channel");
			break;
		}
		if message.is_ping() || message.is_pong() {
			continue;
		}
		if !message.is_binary() {
			warn!(endpoint, "Non-binary message on framed channel, dropping session");
			break;
		}

		let frame = match Frame::decode(message.as_bytes()) {
			Ok(frame) => frame,
			Err(error) => {
				error!(endpoint, %error, "Malformed frame, dropping session");
				break;
			},
		};

		// responses resolve their pending entry; everything else goes to the
		// router on a worker so the next read starts immediately
		if let Some(frame) = session.handle_inbound(frame) {
			spawn_in_span({
				let router = service.router().clone();
				let session = session.clone();
				async move { router.handle_frame(session, frame).await }
			});
		}
	}

	service.registry().disconnect(&endpoint);
}
