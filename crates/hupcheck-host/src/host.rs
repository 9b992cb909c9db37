//! Server operations exposed over the bridge.

use hupcheck::bridge::Registry;
use hupcheck::config::{DEFAULT_BACKLOG, DEFAULT_PORT};

use crate::server::Server;

/// Registry of every operation a driver may call on a [`Server`].
///
/// `retire` is handled by the dispatcher itself and is not listed here.
pub fn registry() -> Registry<Server> {
    let mut registry = Registry::new();
    registry
        .register("bind", |server: &Server, args| {
            let host: String = args.or_default(0, "host", String::new())?;
            let port: u16 = args.or_default(1, "port", DEFAULT_PORT)?;
            server.bind(&host, port)?;
            Ok(())
        })
        .register("listen", |server: &Server, args| {
            let backlog: u32 = args.or_default(0, "backlog", DEFAULT_BACKLOG)?;
            server.listen(backlog)?;
            Ok(())
        })
        .register("run", |server: &Server, _args| {
            server.run()?;
            Ok(())
        })
        .register("close", |server: &Server, _args| {
            server.close()?;
            Ok(())
        })
        .register("pid", |server: &Server, _args| Ok(server.pid()))
        .register("pids", |server: &Server, _args| Ok(server.pids()))
        .register("cookie", |server: &Server, _args| {
            Ok(server.cookie().to_string())
        })
        .register("port", |server: &Server, _args| Ok(server.port()?))
        .register("active", |server: &Server, _args| Ok(server.active()))
        .register("wait", |server: &Server, _args| {
            server.wait();
            Ok(())
        });
    registry
}
