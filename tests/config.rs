use fiberio::config::{self, Config, ConfigVar};
use fiberio::{Error, Fiber};

use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_lookup_registers_once() {
    let first = Config::lookup("test.lookup.value", 7i32, "a value").unwrap();
    let second = Config::lookup("TEST.Lookup.Value", 99i32, "ignored").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.value(), 7);
    assert_eq!(second.name(), "test.lookup.value");
    assert!(Config::get("test.lookup.value").is_some());
}

#[test]
fn test_lookup_with_another_type_fails() {
    Config::lookup("test.typed", 1u16, "typed").unwrap();
    let result = Config::lookup("test.typed", String::from("nope"), "typed");
    assert!(matches!(result, Err(Error::ConfigType { .. })));
}

#[test]
fn test_listeners_see_old_and_new_values() {
    let var = ConfigVar::new("test.listeners", 1i64, "listened");
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let log = seen.clone();
    let key = var.add_listener(move |old, new| log.lock().push((*old, *new)));

    var.set_value(2);
    var.set_value(2);
    var.set_value(5);
    assert_eq!(*seen.lock(), vec![(1, 2), (2, 5)]);

    assert!(var.remove_listener(key));
    var.set_value(9);
    assert_eq!(seen.lock().len(), 2);
    assert_eq!(var.value(), 9);
}

#[test]
fn test_load_from_toml_applies_known_keys() {
    let var = Config::lookup("test.toml.port", 80u32, "port").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    var.add_listener(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    Config::load_from_toml("[test.toml]\nport = 8080\nunknown = true\n").unwrap();
    assert_eq!(var.value(), 8080);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let result = Config::load_from_toml("[test.toml]\nport = \"eighty\"\n");
    assert!(matches!(result, Err(Error::ConfigType { .. })));
    assert_eq!(var.value(), 8080);

    assert!(matches!(Config::load_from_toml("not = [valid"), Err(Error::ConfigParse(_))));
}

#[test]
fn test_builtin_tunables_have_defaults() {
    assert_eq!(config::tcp_connect_timeout().value(), 5000);
    assert_eq!(config::reactor_max_wait().value(), 3000);

    let mut names = Vec::new();
    Config::visit(|var| names.push(var.name().to_string()));
    assert!(names.iter().any(|name| name == config::TCP_CONNECT_TIMEOUT));
}

#[test]
fn test_stack_size_tunable_applies_to_new_fibers() {
    let stack_size = config::fiber_stack_size();
    let default = stack_size.value();
    assert_eq!(default, 128 * 1024);

    Config::load_from_toml("[fiber]\nstack_size = 262144\n").unwrap();
    let fiber = Fiber::new(|| {}, 0).unwrap();
    assert!(fiber.stack_size() >= 262144);

    stack_size.set_value(default);
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Endpoint {
    host: String,
    port: u16,
}

#[test]
fn test_table_values_load_into_structs() {
    let default = Endpoint {
        host: "localhost".to_string(),
        port: 80,
    };
    let var = Config::lookup("test.endpoint", default, "upstream endpoint").unwrap();

    Config::load_from_toml("[test.endpoint]\nhost = \"db\"\nport = 5432\n").unwrap();
    assert_eq!(
        var.value(),
        Endpoint {
            host: "db".to_string(),
            port: 5432,
        }
    );

    let result = Config::load_from_toml("[test.endpoint]\nhost = \"db\"\n");
    assert!(matches!(result, Err(Error::ConfigType { .. })));
    assert_eq!(var.value().port, 5432);
}
