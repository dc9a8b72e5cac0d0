//! PipeCD Protocol - gRPC service definitions
//!
//! Entities travel as JSON documents of the `pipecd_common::model` types so
//! that the wire shape and the stored shape stay identical.

/// Agent-facing API
pub mod pipedservice {
    tonic::include_proto!("pipecd.pipedservice");
}

/// Web-facing API
pub mod webservice {
    tonic::include_proto!("pipecd.webservice");
}

/// External API for pipectl and CI integrations
pub mod apiservice {
    tonic::include_proto!("pipecd.apiservice");
}

/// External authorization checks for the envoy front proxy
pub mod authz {
    tonic::include_proto!("pipecd.authz");
}

/// Encoded descriptor set used by gRPC reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("pipecd_descriptor");
