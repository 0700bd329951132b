//! Stubs shared by the unit tests: a torrent builder, a one-shot HTTP
//! tracker and an in-process seeder.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::metadata::bencode::BencodeValue;
use crate::peer::handshake;
use crate::peer::message::{self, Frame, Message};
use crate::peer::{Bitfield, PeerId};
use crate::util::sha1_hash;

/// Builds a bencoded single-file torrent for `content`.
pub(crate) fn torrent_bytes(announce: &str, content: &[u8], piece_length: usize) -> Vec<u8> {
    let pieces: Vec<u8> = content.chunks(piece_length).flat_map(sha1_hash).collect();
    let info = BencodeValue::Dictionary(BTreeMap::from([
        (b"length".to_vec(), BencodeValue::Integer(content.len() as i64)),
        (b"name".to_vec(), BencodeValue::ByteString(b"sample.bin".to_vec())),
        (b"piece length".to_vec(), BencodeValue::Integer(piece_length as i64)),
        (b"pieces".to_vec(), BencodeValue::ByteString(pieces)),
    ]));
    let root = BencodeValue::Dictionary(BTreeMap::from([
        (b"announce".to_vec(), BencodeValue::ByteString(announce.as_bytes().to_vec())),
        (b"comment".to_vec(), BencodeValue::ByteString(b"test torrent".to_vec())),
        (b"info".to_vec(), info),
    ]));
    Vec::from(&root)
}

/// Serves a single canned HTTP response. The handle yields the request line.
pub(crate) async fn stub_tracker(status: &'static str, body: Vec<u8>) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let head = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).lines().next().unwrap_or_default().to_string()
    });
    (format!("http://{addr}/announce"), handle)
}

/// Compact tracker response listing `peers`.
pub(crate) fn announce_body(peers: &[SocketAddrV4]) -> Vec<u8> {
    let compact: Vec<u8> = peers
        .iter()
        .flat_map(|p| p.ip().octets().into_iter().chain(p.port().to_be_bytes()))
        .collect();
    Vec::from(&BencodeValue::Dictionary(BTreeMap::from([
        (b"interval".to_vec(), BencodeValue::Integer(1800)),
        (b"peers".to_vec(), BencodeValue::ByteString(compact)),
    ])))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behaviour {
    Honest,
    /// Flips the first byte of every piece it serves.
    Corrupt,
}

/// A seeder that owns the pieces marked in `has` and serves any number of
/// connections.
pub(crate) struct Seeder {
    pub info_hash: [u8; 20],
    pub content: Arc<Vec<u8>>,
    pub piece_length: usize,
    pub has: Vec<bool>,
    pub behaviour: Behaviour,
    /// Connections accepted so far.
    pub connections: Arc<AtomicUsize>,
    /// Distinct piece downloads started, counted by requests at offset 0.
    pub pieces_served: Arc<AtomicUsize>,
}

impl Seeder {
    pub(crate) fn new(info_hash: [u8; 20], content: &[u8], piece_length: usize) -> Self {
        let num_pieces = content.len().div_ceil(piece_length);
        Seeder {
            info_hash,
            content: Arc::new(content.to_vec()),
            piece_length,
            has: vec![true; num_pieces],
            behaviour: Behaviour::Honest,
            connections: Arc::new(AtomicUsize::new(0)),
            pieces_served: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn only(mut self, index: usize) -> Self {
        self.has = (0..self.has.len()).map(|i| i == index).collect();
        self
    }

    pub(crate) fn behaving(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub(crate) async fn spawn(self) -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let std::net::SocketAddr::V4(address) = listener.local_addr().unwrap() else {
            unreachable!("bound to an IPv4 address");
        };
        let seeder = Arc::new(self);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                seeder.connections.fetch_add(1, Ordering::SeqCst);
                let seeder = seeder.clone();
                tokio::spawn(async move {
                    let _ = seeder.serve(socket).await;
                });
            }
        });
        address
    }

    async fn serve(&self, mut socket: TcpStream) -> Result<(), crate::peer::PeerError> {
        handshake::exchange(&mut socket, self.info_hash, &PeerId::generate()).await?;

        let mut bitfield = Bitfield::new(self.has.len());
        for (i, _) in self.has.iter().enumerate().filter(|(_, has)| **has) {
            bitfield.mark_piece(i).unwrap();
        }
        let bitmap = bitfield.as_bytes().to_vec();
        message::write_frame(&mut socket, Some(&Frame::from(&Message::Bitfield { bitmap }))).await?;

        loop {
            let Some(frame) = message::read_frame(&mut socket).await? else {
                continue;
            };
            let reply = match Message::try_from(frame)? {
                Message::Interested => Message::Unchoke,
                Message::Request { index, begin, length } if self.has[index as usize] => {
                    let start = index as usize * self.piece_length + begin as usize;
                    if begin == 0 {
                        self.pieces_served.fetch_add(1, Ordering::SeqCst);
                    }
                    let mut block = self.content[start..start + length as usize].to_vec();
                    if self.behaviour == Behaviour::Corrupt && begin == 0 {
                        block[0] ^= 0xFF;
                    }
                    Message::Piece { index, begin, block }
                },
                _ => continue,
            };
            message::write_frame(&mut socket, Some(&Frame::from(&reply))).await?;
        }
    }
}
