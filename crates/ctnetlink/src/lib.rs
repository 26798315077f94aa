//! Async conntrack and netfilter netlink library for Linux.
//!
//! This crate talks to the kernel's connection tracking subsystem over
//! netfilter netlink: dumping and mutating the flow and expectation
//! tables, subscribing to conntrack events, reading per-CPU statistics,
//! and collecting qdisc statistics over route netlink. Generic netlink
//! family resolution is included for callers that need to locate
//! multicast groups by family name.
//!
//! # Example
//!
//! ```ignore
//! use ctnetlink::conntrack::{Conn, DumpOptions};
//!
//! #[tokio::main]
//! async fn main() -> ctnetlink::Result<()> {
//!     let conn = Conn::dial()?;
//!
//!     for flow in conn.dump(DumpOptions::default()).await? {
//!         println!("{:?} -> {:?}", flow.tuple_orig, flow.status);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Event Monitoring
//!
//! ```ignore
//! use ctnetlink::conntrack::{Conn, Event, EventStream};
//! use ctnetlink::netfilter::groups;
//! use tokio_stream::StreamExt;
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(1024);
//! let listener = Conn::dial()?.listen(tx, 4, &groups::CT)?;
//!
//! let mut events = EventStream::new(rx);
//! while let Some(event) = events.next().await {
//!     match event {
//!         Event::New(flow) => println!("new flow: {:?}", flow.tuple_orig),
//!         Event::Destroy(flow) => println!("gone: {:?}", flow.tuple_orig),
//!         _ => {}
//!     }
//! }
//! ```

pub mod conntrack;
pub mod netfilter;
pub mod netlink;
pub mod qdisc;

pub use netlink::{Error, Result};
