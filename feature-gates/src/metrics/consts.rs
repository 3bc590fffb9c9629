// Flag evaluation
pub const FLAG_EVALUATION_COUNTER: &str = "flags_evaluation_total";
pub const FLAG_EVALUATION_ERROR_COUNTER: &str = "flags_evaluation_error_total";

// Admin mutations
pub const FLAG_MUTATION_COUNTER: &str = "flags_mutation_total";

// Gates
pub const GATE_DECISION_COUNTER: &str = "flags_gate_decision_total";

// Canary routing
pub const CANARY_ROUTING_COUNTER: &str = "flags_canary_routing_total";
pub const CANARY_REQUEST_DURATION: &str = "flags_canary_request_duration_seconds";

// HTTP
pub const HTTP_REQUESTS_COUNTER: &str = "http_requests_total";
pub const HTTP_REQUESTS_DURATION: &str = "http_requests_duration_seconds";
