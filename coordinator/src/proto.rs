pub mod verifier {
    pub mod v1 {
        tonic::include_proto!("verifier.v1");
    }
}
