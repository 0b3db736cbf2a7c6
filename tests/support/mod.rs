//! A tiny in-memory RESP server with just enough commands to exercise pipelines and transactions.

#![allow(dead_code)]

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

use kvpipe::codec::FrameCodec;
use kvpipe::Frame;

#[derive(Default)]
struct Db {
    values: HashMap<Bytes, Bytes>,
    // Bumped on every write, WATCH remembers the version it saw.
    versions: HashMap<Bytes, u64>,
}

impl Db {
    fn version(&self, key: &Bytes) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn write(&mut self, key: Bytes, value: Option<Bytes>) {
        *self.versions.entry(key.clone()).or_insert(0) += 1;
        match value {
            Some(value) => self.values.insert(key, value),
            None => self.values.remove(&key),
        };
    }
}

#[derive(Default)]
struct Session {
    queued: Option<Vec<Vec<Bytes>>>,
    watched: Vec<(Bytes, u64)>,
    rejected: bool,
}

#[derive(Clone)]
pub struct Server {
    db: Arc<Mutex<Db>>,
    pub addr: SocketAddr,
}

impl Server {
    pub async fn start() -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let db = Arc::new(Mutex::new(Db::default()));

        tokio::spawn({
            let db = db.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(socket, db.clone()));
                }
            }
        });

        Server { db, addr }
    }

    /// Changes a key behind the back of every client.
    pub fn touch(&self, key: &str, value: &str) {
        self.db
            .lock()
            .unwrap()
            .write(Bytes::from(key.to_string()), Some(Bytes::from(value.to_string())));
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.db
            .lock()
            .unwrap()
            .values
            .get(&Bytes::from(key.to_string()))
            .cloned()
    }
}

async fn serve(socket: TcpStream, db: Arc<Mutex<Db>>) {
    let (reader, mut writer) = socket.into_split();
    let mut frames = FramedRead::new(reader, FrameCodec::new(1024 * 1024));
    let mut session = Session::default();

    while let Some(Ok(frame)) = frames.next().await {
        let args = match frame {
            Frame::Array(parts) => parts
                .into_iter()
                .map(|part| match part {
                    Frame::Bulk(bytes) => bytes,
                    other => Bytes::from(other.to_string()),
                })
                .collect::<Vec<_>>(),
            _ => break,
        };

        let reply = handle(&db, &mut session, args);
        if writer.write_all(&reply.serialize()).await.is_err() {
            break;
        }
    }
}

fn ok() -> Frame {
    Frame::Simple("OK".to_string())
}

fn handle(db: &Arc<Mutex<Db>>, session: &mut Session, args: Vec<Bytes>) -> Frame {
    let name = String::from_utf8_lossy(&args[0]).to_uppercase();

    if let Some(queued) = session.queued.as_mut() {
        match name.as_str() {
            "EXEC" => {
                let queued = session.queued.take().unwrap_or_default();
                let watched = std::mem::take(&mut session.watched);
                if std::mem::take(&mut session.rejected) {
                    return Frame::Error(
                        "EXECABORT Transaction discarded because of previous errors.".to_string(),
                    );
                }
                let mut db = db.lock().unwrap();
                if watched.iter().any(|(key, seen)| db.version(key) != *seen) {
                    return Frame::Null;
                }
                return Frame::Array(queued.into_iter().map(|cmd| execute(&mut db, cmd)).collect());
            }
            "DISCARD" => {
                session.queued = None;
                session.watched.clear();
                session.rejected = false;
                return ok();
            }
            "MULTI" => return Frame::Error("ERR MULTI calls can not be nested".to_string()),
            "SET" | "GET" | "INCR" | "DEL" | "PING" => {
                queued.push(args);
                return Frame::Simple("QUEUED".to_string());
            }
            _ => {
                session.rejected = true;
                return Frame::Error(format!("ERR unknown command '{}'", name));
            }
        }
    }

    match name.as_str() {
        "MULTI" => {
            session.queued = Some(Vec::new());
            ok()
        }
        "EXEC" => Frame::Error("ERR EXEC without MULTI".to_string()),
        "DISCARD" => Frame::Error("ERR DISCARD without MULTI".to_string()),
        "WATCH" => {
            let db = db.lock().unwrap();
            for key in &args[1..] {
                session.watched.push((key.clone(), db.version(key)));
            }
            ok()
        }
        "UNWATCH" => {
            session.watched.clear();
            ok()
        }
        _ => execute(&mut db.lock().unwrap(), args),
    }
}

fn execute(db: &mut Db, args: Vec<Bytes>) -> Frame {
    let name = String::from_utf8_lossy(&args[0]).to_uppercase();

    match (name.as_str(), args.len()) {
        ("PING", 1) => Frame::Simple("PONG".to_string()),
        ("SET", 3) => {
            db.write(args[1].clone(), Some(args[2].clone()));
            ok()
        }
        ("GET", 2) => match db.values.get(&args[1]) {
            Some(value) => Frame::Bulk(value.clone()),
            None => Frame::Null,
        },
        ("DEL", 2) => {
            let existed = db.values.contains_key(&args[1]);
            db.write(args[1].clone(), None);
            Frame::Integer(existed as i64)
        }
        ("INCR", 2) => {
            let current = match db.values.get(&args[1]) {
                None => Ok(0),
                Some(value) => std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(()),
            };
            match current {
                Ok(n) => {
                    db.write(args[1].clone(), Some(Bytes::from((n + 1).to_string())));
                    Frame::Integer(n + 1)
                }
                Err(()) => {
                    Frame::Error("ERR value is not an integer or out of range".to_string())
                }
            }
        }
        (name, _) => Frame::Error(format!(
            "ERR unknown command or wrong number of arguments for '{}'",
            name
        )),
    }
}
