pub(crate) mod client_hasher;
