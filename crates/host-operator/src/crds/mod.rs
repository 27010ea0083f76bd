//! Custom resource definitions.

pub mod host;

pub use host::{
    Attempt, ConsumerRef, HetznerBareMetalHost, HetznerBareMetalHostSpec,
    HetznerBareMetalHostStatus, ImageSource, InstallImage, Partition, RootDeviceHints, SecretRef,
};
