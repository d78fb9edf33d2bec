mod shuffling;

pub(crate) use shuffling::recipients_digest;
