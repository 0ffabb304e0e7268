pub mod addresses;
pub mod bitmap;
pub mod capture;
pub mod controls;
pub mod descriptor;
pub mod ept;
pub mod exits;
pub mod host;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmerror;
pub mod vmlaunch;
pub mod vmxon;
