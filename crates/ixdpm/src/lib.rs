//! Core machinery of the Iluvatar CoreX GPU device plugin.
//!
//! The crate is split along the same lines as the plugin's runtime
//! structure:
//!
//! * [`allocator`] holds the device model: chips scanned from IXML, one-
//!   and two-chip devices, the authoritative [`allocator::DeviceSet`], the
//!   hot-plug reconciler, and the allocation policies.
//! * [`dpm`] is the device plugin lifecycle: the gRPC server on the
//!   kubelet plugin socket, registration, the four plugin RPCs, and the
//!   health monitor.
//! * [`kube`] holds the cluster collaborators: the pod cache, per-node
//!   device ConfigMap publication, the pod-resources client, and the GPU
//!   reset coordinator.
//! * [`config`] has the runtime configuration and the constants shared by
//!   all of the above.
//!
//! The binary crate wires these together with the external collaborators
//! (udev subscription, signal handling, logging sinks).

pub mod allocator;
pub mod config;
pub mod dpm;
pub mod fs_watch;
pub mod grpc_sock;
pub mod kube;

/// Generated types for the kubelet device plugin protocol.
pub mod device_plugin_api {
    pub mod v1beta1 {
        /// Version of the device plugin API this plugin is built against.
        pub const API_VERSION: &str = "v1beta1";
        tonic::include_proto!("v1beta1");
    }
}

/// Generated types for the kubelet pod-resources protocol.
pub mod pod_resources_api {
    pub mod v1alpha1 {
        tonic::include_proto!("v1alpha1");
    }
}

#[cfg(test)]
pub(crate) mod test_support;
