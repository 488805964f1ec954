pub mod split_tunneld;
