//! Native protocol wire layer.
//!
//! Pure encoding plus the async `Reader`; no connection state lives here.

pub mod block;
pub mod buffer;
pub mod city;
pub mod compress;
pub mod feature;
pub mod packet;
pub mod reader;

pub use block::{Block, BlockInfo, DecodeLimits, Results};
pub use buffer::Buffer;
pub use compress::Method;
pub use feature::{CLIENT_REVISION, Feature, negotiate};
pub use packet::{
    ClientCode, ClientHello, ClientInfo, Exception, LogLine, Parameter, ProfileEvent,
    ProfileEventKind, ProfileInfo, Progress, QueryPacket, ServerCode, ServerHello, Setting,
    Stage, TableColumns, TraceContext,
};
pub use reader::Reader;
