//! Wire Protocol
//!
//! Clients talk to the server in newline-delimited JSON datagrams. Each
//! request line names an operation and carries its key, value, TTL and value
//! kind as strings; each reply line carries a status and whatever the
//! operation returns.
//!
//! ## Example
//!
//! ```
//! use tidekv::protocol::{DatagramCodec, OpCode, Reply};
//! use bytes::BytesMut;
//!
//! let codec = DatagramCodec::default();
//!
//! let mut incoming = BytesMut::from(&b"{\"op\":\"get\",\"key\":\"name\"}\n"[..]);
//! let request = codec.decode(&mut incoming).unwrap().unwrap();
//! assert_eq!(request.op, OpCode::Get);
//!
//! let mut outgoing = BytesMut::new();
//! codec.encode(&Reply::text("Ariz"), &mut outgoing).unwrap();
//! ```

pub mod datagram;

pub use datagram::{
    DatagramCodec, KeyEntry, OpCode, ProtocolError, Reply, Request, Status,
    DEFAULT_MAX_DATAGRAM_SIZE,
};
