/*
 * Copyright (C) 2024 The Android Open Source Project
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Command server over an abstract unix socket.
//!
//! Each HAL daemon serves its fixed method contract as a request enum; the
//! server decodes one JSON request at a time per connection and answers with
//! a [`Reply`]. Connections are handled on their own thread.

use std::os::fd::AsFd;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::thread;

use anyhow::{Context, Result};
use log::{error, info};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::{Pid, Uid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Response envelope sent for every request.
#[derive(Debug, Serialize, Deserialize)]
pub enum Reply<T> {
    Ok(T),
    Err(String),
}

/// Per-connection request handler. One session exists for the lifetime of
/// each client connection; [`ClientSession::hangup`] runs when the
/// connection closes, whether cleanly or not.
pub trait ClientSession: Send {
    type Request: DeserializeOwned;
    type Response: Serialize;

    fn handle(&mut self, request: Self::Request) -> Result<Self::Response>;

    fn hangup(&mut self) {}
}

fn get_peer_cred<F: AsFd>(fd: &F) -> Result<(Uid, Pid)> {
    let creds = getsockopt(fd, PeerCredentials)?;
    Ok((Uid::from_raw(creds.uid()), Pid::from_raw(creds.pid())))
}

fn handle_client<S: ClientSession>(stream: &UnixStream, session: &mut S) -> Result<()> {
    let (uid, pid) = get_peer_cred(&stream).context("Failed to get peer credentials")?;
    info!("Client connected: uid = {uid}, pid = {pid}");
    let mut de = serde_json::Deserializer::from_reader(stream);
    let mut se = serde_json::Serializer::new(stream);
    loop {
        let request = match S::Request::deserialize(&mut de) {
            Ok(request) => request,
            Err(ref e) if e.is_eof() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match session.handle(request) {
            Ok(response) => Reply::Ok(response).serialize(&mut se)?,
            Err(e) => {
                error!("Request failed: {e:#}");
                Reply::<S::Response>::Err(format!("{e:#}")).serialize(&mut se)?;
            }
        }
    }
}

/// Binds the named abstract socket and serves each connection with its own
/// session until the process exits.
pub fn serve_sessions<S, F>(socket_name: &str, make_session: F) -> Result<()>
where
    S: ClientSession + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    let addr = SocketAddr::from_abstract_name(socket_name)?;
    let listener = UnixListener::bind_addr(&addr)?;
    info!("Listening on {socket_name}");

    let make_session = std::sync::Arc::new(make_session);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let make_session = make_session.clone();
                thread::spawn(move || {
                    let mut session = make_session();
                    if let Err(e) = handle_client(&stream, &mut session) {
                        error!("Error handling client: {e:?}");
                    }
                    session.hangup();
                });
            }
            Err(e) => {
                error!("Error accepting connection: {e}");
            }
        }
    }
    Ok(())
}

struct FnSession<Req, Resp, F> {
    handler: std::sync::Arc<F>,
    _contract: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> ClientSession for FnSession<Req, Resp, F>
where
    Req: DeserializeOwned + Send,
    Resp: Serialize + Send,
    F: Fn(Req) -> Result<Resp> + Send + Sync,
{
    type Request = Req;
    type Response = Resp;

    fn handle(&mut self, request: Req) -> Result<Resp> {
        (self.handler)(request)
    }
}

/// Binds the named abstract socket and serves requests until the process
/// exits. This is the daemon main loop for services with no per-connection
/// state.
pub fn serve<Req, Resp, F>(socket_name: &str, handler: F) -> Result<()>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Result<Resp> + Send + Sync + 'static,
{
    let handler = std::sync::Arc::new(handler);
    serve_sessions(socket_name, move || FnSession {
        handler: handler.clone(),
        _contract: std::marker::PhantomData,
    })
}

/// Connects to a daemon's abstract socket.
pub fn connect(socket_name: &str) -> Result<UnixStream> {
    let addr = SocketAddr::from_abstract_name(socket_name)?;
    UnixStream::connect_addr(&addr)
        .with_context(|| format!("Failed to connect to {socket_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    enum Ping {
        Echo(String),
        Fail,
    }

    #[test]
    fn round_trip_and_error_reply() {
        let name = format!("mata_hal_ipc_test_{}", std::process::id());
        {
            let name = name.clone();
            thread::spawn(move || {
                serve(&name, |req: Ping| match req {
                    Ping::Echo(s) => Ok(s),
                    Ping::Fail => anyhow::bail!("nope"),
                })
                .unwrap();
            });
        }

        // The server binds asynchronously.
        let stream = connect_with_retries(&name);

        let mut de = serde_json::Deserializer::from_reader(&stream);
        let mut se = serde_json::Serializer::new(&stream);

        Ping::Echo("hello".to_string()).serialize(&mut se).unwrap();
        match Reply::<String>::deserialize(&mut de).unwrap() {
            Reply::Ok(s) => assert_eq!(s, "hello"),
            Reply::Err(e) => panic!("unexpected error: {e}"),
        }

        Ping::Fail.serialize(&mut se).unwrap();
        match Reply::<String>::deserialize(&mut de).unwrap() {
            Reply::Ok(_) => panic!("expected an error reply"),
            Reply::Err(e) => assert!(e.contains("nope")),
        }
    }

    struct EchoSession {
        served: u32,
        on_hangup: mpsc::Sender<u32>,
    }

    impl ClientSession for EchoSession {
        type Request = Ping;
        type Response = String;

        fn handle(&mut self, request: Ping) -> Result<String> {
            self.served += 1;
            match request {
                Ping::Echo(s) => Ok(s),
                Ping::Fail => anyhow::bail!("nope"),
            }
        }

        fn hangup(&mut self) {
            let _ = self.on_hangup.send(self.served);
        }
    }

    fn connect_with_retries(name: &str) -> UnixStream {
        let mut attempts = 0;
        loop {
            match connect(name) {
                Ok(stream) => return stream,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("connect failed: {e:?}"),
            }
        }
    }

    #[test]
    fn session_hangup_runs_when_the_client_disconnects() {
        let name = format!("mata_hal_ipc_hangup_test_{}", std::process::id());
        let (tx, rx) = mpsc::channel();
        {
            let name = name.clone();
            thread::spawn(move || {
                serve_sessions(&name, move || EchoSession { served: 0, on_hangup: tx.clone() })
                    .unwrap();
            });
        }

        let stream = connect_with_retries(&name);
        let mut de = serde_json::Deserializer::from_reader(&stream);
        let mut se = serde_json::Serializer::new(&stream);
        Ping::Echo("bye".to_string()).serialize(&mut se).unwrap();
        match Reply::<String>::deserialize(&mut de).unwrap() {
            Reply::Ok(s) => assert_eq!(s, "bye"),
            Reply::Err(e) => panic!("unexpected error: {e}"),
        }
        drop(de);
        drop(se);
        drop(stream);

        let served = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(served, 1);
    }
}
