pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

pub const PIC_PATH: &str = "/pic";
pub const JOB_PATH: &str = "/job";
pub const REFRESH_PATH: &str = "/fail2refresh.js";

pub const PARAM_URL: &str = "url";
pub const PARAM_SESSION: &str = "sid";

pub const JOB_ACK: &str = "Job Received!";
pub const REFRESH_RELOAD: &str = "window.location.reload();";
pub const REFRESH_NORMAL: &str = "/* normal */";

pub const MAX_REDIRECTS: usize = 10;
