mod fixtures;
mod listeners;
mod partitions;
mod routing;
