//! Entry point: configuration, trace bootstrap, and the client/server flows.

use std::time::{Duration, Instant};

use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use tlsprobe_tooling::logging::{LogLevel, Logger};
use tlsprobe_tooling::{strings, trace_line};

use tlsprobe::configuration::{loader, Configuration, NetworkMode};
use tlsprobe::manipulation::Pipeline;
use tlsprobe::network::tcp::{SharedTcpConnection, TcpConnection, TcpServer};
use tlsprobe::network::timestamp::TimestampObserver;
use tlsprobe::tls::log_filter;
use tlsprobe::tls::session::Session;
use tlsprobe::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Internal diagnostics go to stderr through log4rs; the trace on stdout
/// stays the tool's product surface.
fn init_internal_logging() {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{d}\t{l}\t{t}\t{m}{n}")))
        .build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(log::LevelFilter::Warn));
    if let Ok(config) = config {
        let _ = log4rs::init_config(config);
    }
}

fn log_error(logger: &Logger, category: &str, context: &str, error: &Error) {
    trace_line!(
        logger,
        LogLevel::High,
        category,
        "{}: {}",
        context,
        strings::remove_newlines(&error.to_string())
    );
}

fn check_tcp_connection(tcp: &SharedTcpConnection, logger: &Logger) -> bool {
    if tcp.borrow_mut().is_closed(false) {
        trace_line!(logger, LogLevel::High, "Network", "TCP/IP connection is closed.");
        false
    } else {
        true
    }
}

fn wait_for_closed_tcp_connection(
    configuration: &Configuration,
    tcp: &SharedTcpConnection,
    logger: &Logger,
) {
    let timeout = Duration::from_secs(configuration.wait_before_close_seconds);
    trace_line!(
        logger,
        LogLevel::High,
        "Network",
        "Wait at most {} s for closing of the TCP/IP connection.",
        configuration.wait_before_close_seconds
    );
    let start = Instant::now();
    loop {
        if !check_tcp_connection(tcp, logger) {
            break;
        }
        if start.elapsed() > timeout {
            trace_line!(logger, LogLevel::High, "Network", "TCP/IP connection is still open.");
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn configure_tls_session(
    configuration: &Configuration,
    session: &mut Session,
    logger: &Logger,
) -> bool {
    if configuration.has_tls_version() {
        session.set_version(configuration.tls_version);
    }
    if configuration.has_tls_cipher_suites() {
        session.set_cipher_suites(&configuration.tls_cipher_suites);
    }
    if !configuration.tls_secret_file.is_empty() {
        match std::fs::File::options()
            .append(true)
            .create(true)
            .open(&configuration.tls_secret_file)
        {
            Ok(file) => session.set_secret_output(Box::new(file)),
            Err(e) => {
                trace_line!(
                    logger,
                    LogLevel::High,
                    "TLS",
                    "Configuring TLS secret file failed: {}",
                    e
                );
                return false;
            }
        }
    }
    session.set_wait_for_alert_seconds(configuration.wait_before_close_seconds);
    session.set_tcp_receive_timeout_seconds(configuration.tcp_receive_timeout_seconds);
    session.set_server_simulation(configuration.tls_server_simulation);
    if configuration.tls_server_simulation == 6 {
        if let Some(delay) = configuration.tls_server_simulation_delay {
            session.set_server_simulation_delay(delay);
        }
    }
    true
}

fn configure_certificates(
    configuration: &Configuration,
    session: &mut Session,
    logger: &Logger,
) -> bool {
    if configuration.certificate_file.is_empty() || configuration.private_key_file.is_empty() {
        return true;
    }
    let certificate = match std::fs::read(&configuration.certificate_file) {
        Ok(data) => data,
        Err(e) => {
            trace_line!(
                logger,
                LogLevel::High,
                "TLS",
                "Loading certificate and private key files failed: {}",
                e
            );
            return false;
        }
    };
    let private_key = match std::fs::read(&configuration.private_key_file) {
        Ok(data) => data,
        Err(e) => {
            trace_line!(
                logger,
                LogLevel::High,
                "TLS",
                "Loading certificate and private key files failed: {}",
                e
            );
            return false;
        }
    };
    if let Err(e) = session.set_certificate(&certificate, &private_key) {
        log_error(logger, "TLS", "Loading certificate and private key files failed", &e);
        return false;
    }
    true
}

fn prepare_tls_session(
    configuration: &Configuration,
    session: &mut Session,
    logger: &Logger,
) -> bool {
    configure_tls_session(configuration, session, logger)
        && configure_certificates(configuration, session, logger)
}

fn execute_tls_session(
    configuration: &Configuration,
    mut session: Session,
    tcp: SharedTcpConnection,
    logger: &Logger,
    socket_timeout_seconds: u64,
    close_timeout_seconds: u64,
) {
    {
        let observer = TimestampObserver::new(&tcp.borrow(), logger.clone());
        tcp.borrow_mut().register_observer(Box::new(observer));
    }
    let mut pipeline = Pipeline::new(configuration.manipulations.clone());
    let handshake = (|| -> Result<(), Error> {
        pipeline.pre_handshake(&mut session);
        session.perform_handshake(&mut pipeline)?;
        pipeline.post_handshake(&mut session);
        Ok(())
    })();
    if let Err(e) = handshake {
        log_error(logger, "TLS", "TLS handshake failed", &e);
        wait_for_closed_tcp_connection(configuration, &tcp, logger);
        return;
    }
    if !check_tcp_connection(&tcp, logger) {
        return;
    }
    if socket_timeout_seconds != 0 {
        let timeout = Duration::from_secs(socket_timeout_seconds);
        let start = Instant::now();
        while tcp.borrow().available() == 0 {
            if start.elapsed() > timeout {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    if tcp.borrow().available() > 0 {
        match session.receive_application_data() {
            Ok(data) => {
                trace_line!(
                    logger,
                    LogLevel::High,
                    "TLS",
                    "Application data received: {}",
                    strings::byte_array_to_hex_string(&data)
                );
            }
            Err(e) => {
                log_error(logger, "TLS", "Receiving application data failed", &e);
                wait_for_closed_tcp_connection(configuration, &tcp, logger);
                return;
            }
        }
    }
    if let Err(e) = session.close(close_timeout_seconds) {
        log_error(logger, "TLS", "Closing failed", &e);
        wait_for_closed_tcp_connection(configuration, &tcp, logger);
        return;
    }
    check_tcp_connection(&tcp, logger);
    if let Err(e) = tcp.borrow_mut().close() {
        log_error(logger, "Network", "Closing failed", &e);
        log::warn!("closing the TCP connection failed: {}", e);
    }
}

fn run_client(configuration: &Configuration, logger: &Logger) -> i32 {
    let tcp = TcpConnection::shared();
    if let Err(e) = tcp.borrow_mut().connect(&configuration.host, configuration.port) {
        log_error(
            logger,
            "Network",
            &format!(
                "TCP/IP connection to {}:{} failed",
                configuration.host, configuration.port
            ),
            &e,
        );
        return 1;
    }
    {
        let connection = tcp.borrow();
        trace_line!(
            logger,
            LogLevel::High,
            "Network",
            "TCP/IP connection to {}:{} established.",
            connection.remote_ip_address().unwrap_or_default(),
            connection.remote_tcp_port().unwrap_or_default()
        );
    }
    let mut session = Session::new_client(tcp.clone(), logger.clone());
    if !prepare_tls_session(configuration, &mut session, logger) {
        return 1;
    }
    execute_tls_session(configuration, session, tcp, logger, 1, 3);
    0
}

fn run_server(configuration: &Configuration, logger: &Logger) -> i32 {
    loop {
        let mut server = TcpServer::new();
        if let Err(e) = server.listen(configuration.port) {
            log_error(
                logger,
                "Network",
                &format!("Listening on port {} failed", configuration.port),
                &e,
            );
            return 1;
        }
        trace_line!(
            logger,
            LogLevel::High,
            "Network",
            "Waiting for TCP/IP connection on port {}.",
            configuration.port
        );
        let tcp = server.client();
        let mut session = Session::new_server(tcp.clone(), logger.clone());
        if !prepare_tls_session(configuration, &mut session, logger) {
            return 1;
        }
        let timeout = Duration::from_secs(configuration.listen_timeout_seconds);
        let start = Instant::now();
        // Flush once before entering the accept loop.
        logger.flush();
        let mut accepted = false;
        loop {
            server.work();
            let client_ready = {
                let mut connection = tcp.borrow_mut();
                connection.is_open() && !connection.is_closed(false) && connection.available() > 0
            };
            if client_ready {
                server.close();
                {
                    let connection = tcp.borrow();
                    trace_line!(
                        logger,
                        LogLevel::High,
                        "Network",
                        "TCP/IP connection from {}:{} received.",
                        connection.remote_ip_address().unwrap_or_default(),
                        connection.remote_tcp_port().unwrap_or_default()
                    );
                }
                execute_tls_session(configuration, session, tcp.clone(), logger, 0, 0);
                accepted = true;
                break;
            }
            if configuration.listen_timeout_seconds != 0 && start.elapsed() > timeout {
                trace_line!(
                    logger,
                    LogLevel::High,
                    "Network",
                    "Listen timeout after {} s.",
                    configuration.listen_timeout_seconds
                );
                break;
            }
        }
        if !accepted {
            // No peer within the window: an orderly end, not an error.
            return 0;
        }
    }
}

fn main() {
    init_internal_logging();
    let logger = Logger::to_stdout();
    logger.set_column_separator("\t");
    logger.set_log_level(LogLevel::High);

    let configuration = match loader::parse(std::env::args()) {
        Ok(configuration) => configuration,
        Err(e) => {
            log_error(&logger, "Tool", "Parsing the configuration failed", &e);
            logger.flush();
            std::process::exit(1);
        }
    };
    trace_line!(
        logger,
        LogLevel::High,
        "Tool",
        "tlsprobe version {}",
        env!("CARGO_PKG_VERSION")
    );
    log::debug!(
        "configuration: mode={:?} host={} port={}",
        configuration.mode,
        configuration.host,
        configuration.port
    );

    log_filter::register_filters(&logger);
    logger.set_log_level(configuration.log_level);

    let code = match configuration.mode {
        NetworkMode::Client => run_client(&configuration, &logger),
        NetworkMode::Server => run_server(&configuration, &logger),
        NetworkMode::Unknown => {
            trace_line!(
                logger,
                LogLevel::High,
                "Tool",
                "Parsing the configuration failed: mode has not been set"
            );
            1
        }
    };
    trace_line!(logger, LogLevel::High, "Tool", "tlsprobe exiting.");
    logger.flush();
    std::process::exit(code);
}
