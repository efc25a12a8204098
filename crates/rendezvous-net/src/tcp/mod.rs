mod driver;
mod repeater;
mod stream;

pub use driver::{PollEvent, TcpDriver};
pub use stream::ConnState;
pub(crate) use stream::TcpStream;
