//! 推送通道传输层（TCP，每行一个 JSON）
//!
//! 每个客户端连接对应两个线程：
//! - 读线程：逐行解析客户端消息并交给会话处理
//! - 写线程：把通知总线投递到该客户端的通知逐行写出
//!
//! 读到 `Disconnected` 哨兵、`unload` 消息、无法识别的消息或连接断开时，
//! 客户端被注销（同时释放键盘控制权），写线程随通道关闭而退出。

use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use spot_protocol::{Inbound, Notification};
use spot_session::{ClientId, Session};
use tracing::{debug, error, info, warn};

/// TCP 推送通道
pub struct Transport {
    listener: TcpListener,
    session: Arc<Session>,
}

impl Transport {
    pub fn bind(addr: impl ToSocketAddrs, session: Arc<Session>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, session })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接（阻塞，直到监听套接字出错）
    pub fn serve(&self) -> io::Result<()> {
        info!("Push channel listening on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let session = Arc::clone(&self.session);
                    let peer = stream.peer_addr().ok();
                    if let Err(e) = thread::Builder::new()
                        .name("spot-client-rx".to_string())
                        .spawn(move || {
                            if let Err(e) = handle_client(session, stream) {
                                warn!("Client {:?} connection error: {}", peer, e);
                            }
                        })
                    {
                        error!("Failed to spawn client thread: {}", e);
                    }
                },
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
        Ok(())
    }
}

fn handle_client(session: Arc<Session>, stream: TcpStream) -> io::Result<()> {
    let writer_stream = stream.try_clone()?;
    let (client, notifications) = session.client_connected();

    let writer = match thread::Builder::new()
        .name(format!("spot-client-{}-tx", client))
        .spawn(move || write_loop(client, writer_stream, notifications))
    {
        Ok(writer) => writer,
        Err(e) => {
            session.client_disconnected(client);
            return Err(e);
        },
    };

    read_loop(&session, client, &stream);

    session.client_disconnected(client);
    let _ = stream.shutdown(Shutdown::Both);
    if writer.join().is_err() {
        error!("Client {} writer thread panicked", client);
    }
    Ok(())
}

fn read_loop(session: &Arc<Session>, client: ClientId, stream: &TcpStream) {
    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("Client {} read error: {}", client, e);
                break;
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        match Inbound::parse(&line) {
            Ok(Inbound::Disconnected) => break,
            Ok(Inbound::Message(message)) => {
                if !session.handle_message(client, message) {
                    break;
                }
            },
            Err(e) => {
                warn!("Client {} sent an unrecognized message, closing: {}", client, e);
                break;
            },
        }
    }
    info!("Socket closed: {}", client);
}

fn write_loop(client: ClientId, stream: TcpStream, notifications: Receiver<Notification>) {
    let mut writer = BufWriter::new(stream);
    for notification in notifications.iter() {
        let written = writeln!(writer, "{}", notification.to_json()).and_then(|()| writer.flush());
        if let Err(e) = written {
            debug!("Client {} write error: {}", client, e);
            break;
        }
    }
    debug!("Client {} writer exited", client);
}
