use clap::{App, Arg};
use grout::logging;
use keystone::config::Transport;
use keystone::toolset::ToolSet;
use keystone::{Dispatcher, McpConfig, RpcError};
use mortar::http::engine::{Acceptor, ServerConfig, ServerCore};
use mortar::http::router::Router;
use mortar::net::addr::SocketKind;
use mortar::net::reactor::{Interest, Reactor, ReactorConfig};
use mortar::net::socket::Listener;
use mortar::pool::{PoolConfig, WorkerPool};
use mortar::BindAddress;
use serde_json::{json, Value};
use std::path::Path;
use std::process;
use std::rc::Rc;

fn demo_tools() -> ToolSet {
    let mut tools = ToolSet::new();

    tools.add(
        "echo",
        "Returns its arguments unchanged",
        json!({"type": "object"}),
        |_, arguments| Ok(json!({ "echoed": arguments })),
    );

    tools.add(
        "add",
        "Adds the numbers `a` and `b`",
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"},
            },
            "required": ["a", "b"],
        }),
        |_, arguments| {
            let a = arguments
                .get("a")
                .and_then(Value::as_f64)
                .ok_or_else(|| RpcError::invalid_params("a must be a number"))?;
            let b = arguments
                .get("b")
                .and_then(Value::as_f64)
                .ok_or_else(|| RpcError::invalid_params("b must be a number"))?;

            Ok(json!({ "result": a + b }))
        },
    );

    tools.add(
        "clock",
        "Returns the server's unix timestamp",
        json!({"type": "object"}),
        |_, _| Ok(json!({ "timestamp": grout::time::timestamp_secs() })),
    );

    tools
}

fn register_catalog_methods(dispatcher: &mut Dispatcher) {
    dispatcher.register("prompts/list", |_, _| {
        Ok(json!({
            "prompts": [{
                "name": "summarize",
                "description": "Summarize the provided text",
                "arguments": [{"name": "text", "required": true}],
            }],
        }))
    });

    dispatcher.register("prompts/get", |_, params| {
        let name = params
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing prompt name"))?;

        if name != "summarize" {
            return Err(RpcError::invalid_params("unknown prompt"));
        }

        Ok(json!({
            "messages": [{
                "role": "user",
                "content": {"type": "text", "text": "Summarize the following text."},
            }],
        }))
    });

    dispatcher.register("resources/list", |_, _| {
        Ok(json!({
            "resources": [{
                "uri": "mem://motd",
                "name": "Message of the day",
                "mimeType": "text/plain",
            }],
        }))
    });

    dispatcher.register("resources/read", |_, params| {
        let uri = params
            .and_then(|params| params.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing uri"))?;

        if uri != "mem://motd" {
            return Err(RpcError::invalid_params("unknown resource"));
        }

        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "text/plain",
                "text": "All joints mortared and true.",
            }],
        }))
    });

    dispatcher.register("resources/subscribe", |_, _| Ok(json!({})));
    dispatcher.register("resources/unsubscribe", |_, _| Ok(json!({})));
    dispatcher.register("resources/templates/list", |_, _| {
        Ok(json!({ "resourceTemplates": [] }))
    });
}

pub fn main() {
    let matches = App::new("MCP Gateway")
        .version("1.0")
        .author("Mortarworks")
        .about("Runs the MCP gateway server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the JSON config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config =
        McpConfig::load(Path::new(config_path)).expect("Error reading the configuration file");

    let logger = logging::init();

    if config.transport == Transport::Stdio {
        logging::error!(logger, "stdio transport is not served by this gateway");
        process::exit(1);
    }

    let mut reactor = Reactor::new(ReactorConfig::default(), logger.new(logging::o!()))
        .expect("Error creating the reactor");
    let stop = reactor.stop_handle();

    let mut dispatcher = Dispatcher::new(config.clone(), logger.new(logging::o!()));

    demo_tools().install(&mut dispatcher);
    register_catalog_methods(&mut dispatcher);

    dispatcher.register("shutdown", move |_, _| {
        stop.stop();
        Ok(json!({}))
    });

    let dispatcher = Rc::new(dispatcher);
    let mut router = Router::new();

    Rc::clone(&dispatcher).install(&mut router);

    let mut server_config = ServerConfig::default();

    server_config.limits.max_body = config.max_message_size;

    if let Some(chain) = config.auth_chain() {
        server_config.auth = chain;
    }

    let pool = WorkerPool::start(
        PoolConfig::default(),
        reactor.wakeup(),
        logger.new(logging::o!()),
    );

    let core = ServerCore::new(server_config, router, Some(pool), logger.new(logging::o!()));

    core.add_housekeeper(dispatcher.clone());

    let address: BindAddress = config
        .bind_address()
        .parse()
        .expect("Error parsing the bind address");
    let listener = Listener::bind(&address, SocketKind::Stream).expect("Error binding the listener");

    logging::info!(
        logger,
        "gateway listening";
        "address" => %address,
        "endpoint" => config.endpoint.as_str()
    );

    reactor
        .register(Box::new(Acceptor::new(listener, core)), Interest::Read)
        .expect("Error registering the listener");

    if let Err(err) = reactor.run() {
        logging::error!(logger, "reactor failed"; "error" => ?err);
        process::exit(1);
    }
}
