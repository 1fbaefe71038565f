pub(crate) mod main;
