/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! refresh_domain {
    () => {
        "stable.example.com"
    };
    ($s:literal) => {
        concat!(refresh_domain!(), "/", $s)
    };
}

pub const API_GROUP: &str = refresh_domain!();
pub const API_VERSION: &str = refresh_domain!("v1alpha1");
pub const OPERATOR: &str = "node-refresh-operator";

// We can't use these consts inside the CustomResource derive macro, but we do provide constants
// for use when generating kubernetes objects and patches.
pub const K8S_REFRESH_KIND: &str = "NodeRefresh";
pub const K8S_REFRESH_PLURAL: &str = "noderefreshes";
pub const K8S_REFRESH_STATUS: &str = "noderefreshes/status";
pub const K8S_REFRESH_SHORTNAME: &str = "nrf";

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_NAME: &str = "app.kubernetes.io/name";

// The downward-API env var carrying the name of the node hosting the controller pod.
pub const NODE_NAME_ENV_VAR: &str = "MY_NODE_NAME";

// controller constants
pub const CONTROLLER_INTERNAL_PORT: i32 = 8080; // The internal port on which controller metrics are hosted.
