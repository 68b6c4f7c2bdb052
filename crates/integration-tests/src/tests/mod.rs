mod cache;
mod composefs;
mod layer_store;
mod path_safety;
mod pull;
