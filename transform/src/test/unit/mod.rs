mod fold;
mod shape;
