//! Metric wrappers, all under the `duplexd.` prefix. Thin functions
//! over the `metrics` facade so call sites stay one line.

pub fn server_started() {
    metrics::counter!("duplexd.server.starts").increment(1);
}

pub fn accept_error() {
    metrics::counter!("duplexd.listener.accept_errors").increment(1);
}

pub fn connection_accepted() {
    metrics::counter!("duplexd.connections.total").increment(1);
    metrics::gauge!("duplexd.connections.active").increment(1.0);
}

pub fn connection_rejected(reason: &'static str) {
    metrics::counter!("duplexd.connections.rejected", "reason" => reason).increment(1);
}

pub fn connection_closed(outcome: &'static str) {
    metrics::counter!("duplexd.connections.closed", "outcome" => outcome).increment(1);
    metrics::gauge!("duplexd.connections.active").decrement(1.0);
}

pub fn setup_accepted() {
    metrics::counter!("duplexd.setups.accepted").increment(1);
}

pub fn setup_rejected() {
    metrics::counter!("duplexd.setups.rejected").increment(1);
}

pub fn frame_received(kind: &'static str) {
    metrics::counter!("duplexd.frames.received", "kind" => kind).increment(1);
}

pub fn frame_sent(kind: &'static str) {
    metrics::counter!("duplexd.frames.sent", "kind" => kind).increment(1);
}

pub fn session_error() {
    metrics::counter!("duplexd.sessions.errors").increment(1);
}
