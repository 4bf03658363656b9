pub(crate) mod timer;
