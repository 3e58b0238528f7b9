use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a 9P address of the form `proto!host[!port]` into its parts.
///
/// The port is optional: `unix!/path/to/socket` has none, while
/// `tcp!example.com!564` does.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, Option<&str>)> {
    let mut split = arg.splitn(3, '!');
    let proto = split.next()?;
    let host = split.next()?;
    let port = split.next();

    Some((proto, host, port))
}
